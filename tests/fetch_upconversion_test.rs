mod common;

use std::collections::BTreeSet;

use rusqlite::params;

use common::{rev, Deposited, Renamed, RenamedV1, RenamedV2, Withdrawn};
use eventline::{
    AppendCommand, ContractFilter, Error, EventRecord, ExpectedVersion, FetchedEvent, GlobalPos,
};

#[tokio::test]
async fn old_contracts_arrive_in_their_current_shape() {
    let (_dir, _path, db) = common::open_temp_db("upconvert.db").await;

    let records = vec![
        db.encode(rev(1), &RenamedV1 { name: "Ada Lovelace".into() }).unwrap(),
        db.encode(
            rev(2),
            &RenamedV2 {
                first: "Grace".into(),
                last: "Hopper".into(),
            },
        )
        .unwrap(),
        db.encode(rev(3), &Renamed { display: "Turing, Alan".into() }).unwrap(),
    ];
    db.append(AppendCommand::new("person-1", ExpectedVersion::NoStream, records))
        .await
        .unwrap();
    common::linearize_all(&db).await;

    let fetched = db.fetch(ContractFilter::All, GlobalPos::START, 10).await.unwrap();
    let displays: Vec<String> = fetched
        .into_iter()
        .map(|f| {
            let envelope = f.into_result().unwrap();
            assert_eq!(envelope.event.contract_name(), "Renamed");
            envelope.event.downcast::<Renamed>().unwrap().display
        })
        .collect();
    assert_eq!(
        displays,
        vec!["Lovelace, Ada", "Hopper, Grace", "Turing, Alan"]
    );

    // The stored payload is untouched.
    let stored = db.load("person-1", rev(1)).await.unwrap();
    assert_eq!(stored[0].contract_name, "Renamed.v1");

    db.shutdown().await;
}

#[tokio::test]
async fn paging_by_checkpoint_has_no_overlap_and_no_gap() {
    let (_dir, _path, db) = common::open_temp_db("paging.db").await;
    for s in 0..5 {
        common::deposit(&db, &format!("s{s}"), &[1, 2, 3]).await;
    }
    common::linearize_all(&db).await;

    for page_size in [1, 2, 4, 15, 100] {
        let mut after = GlobalPos::START;
        let mut seen = Vec::new();
        loop {
            let page = db.fetch(ContractFilter::All, after, page_size).await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= page_size);
            for fetched in &page {
                seen.push(fetched.position().as_raw());
            }
            after = page.last().unwrap().position();
        }
        assert_eq!(seen, (1..=15).collect::<Vec<u64>>(), "page size {page_size}");
    }

    db.shutdown().await;
}

#[tokio::test]
async fn contract_filter_matches_whole_commits() {
    let (_dir, _path, db) = common::open_temp_db("filter.db").await;

    // Commit 1: deposit only. Commit 2: deposit + withdrawal. Commit 3:
    // withdrawal only.
    common::deposit(&db, "acct", &[100]).await;
    let mixed = vec![
        db.encode(rev(2), &Deposited { amount: 5 }).unwrap(),
        db.encode(rev(3), &Withdrawn { amount: 50 }).unwrap(),
    ];
    db.append(AppendCommand::new("acct", ExpectedVersion::exact(1), mixed))
        .await
        .unwrap();
    let withdrawal = vec![db.encode(rev(4), &Withdrawn { amount: 1 }).unwrap()];
    db.append(AppendCommand::new("acct", ExpectedVersion::exact(3), withdrawal))
        .await
        .unwrap();
    common::linearize_all(&db).await;

    let positions = |fetched: Vec<FetchedEvent>| -> Vec<u64> {
        fetched.iter().map(|f| f.position().as_raw()).collect()
    };

    let withdrawn = db
        .fetch(ContractFilter::contracts(["Withdrawn"]), GlobalPos::START, 10)
        .await
        .unwrap();
    assert_eq!(positions(withdrawn), vec![2, 3, 4]);

    let deposited = db
        .fetch(ContractFilter::contracts(["Deposited"]), GlobalPos::START, 10)
        .await
        .unwrap();
    assert_eq!(positions(deposited), vec![1, 2, 3]);

    let empty = db
        .fetch(ContractFilter::Contracts(BTreeSet::new()), GlobalPos::START, 10)
        .await
        .unwrap();
    assert_eq!(positions(empty), vec![1, 2, 3, 4]);

    let none = db
        .fetch(ContractFilter::contracts(["Unrelated"]), GlobalPos::START, 10)
        .await
        .unwrap();
    assert!(none.is_empty());

    db.shutdown().await;
}

#[tokio::test]
async fn metadata_rides_on_the_first_event_of_a_commit() {
    let (_dir, _path, db) = common::open_temp_db("metadata.db").await;

    let records = vec![
        db.encode(rev(1), &Deposited { amount: 1 }).unwrap(),
        db.encode(rev(2), &Deposited { amount: 2 }).unwrap(),
    ];
    let command = AppendCommand::new("acct", ExpectedVersion::NoStream, records)
        .with_commit_id("commit-42")
        .with_metadata("user", "alice")
        .with_metadata("correlation", "abc");
    db.append(command).await.unwrap();
    common::linearize_all(&db).await;

    let fetched = db.fetch(ContractFilter::All, GlobalPos::START, 10).await.unwrap();
    let first = fetched[0].envelope().unwrap();
    let second = fetched[1].envelope().unwrap();

    assert_eq!(first.metadata.get("user").map(String::as_str), Some("alice"));
    assert_eq!(first.metadata.len(), 2);
    assert!(second.metadata.is_empty());
    assert_eq!(first.commit_id.as_str(), "commit-42");
    assert_eq!(second.commit_id.as_str(), "commit-42");
    assert!(first.created_ms > 0);

    db.shutdown().await;
}

#[tokio::test]
async fn undecodable_rows_are_reported_in_place() {
    let (_dir, path, db) = common::open_temp_db("failures.db").await;

    common::deposit(&db, "a", &[1]).await;
    db.append(AppendCommand::new(
        "b",
        ExpectedVersion::NoStream,
        vec![EventRecord::new(rev(1), "NeverRegistered", b"{}".to_vec())],
    ))
    .await
    .unwrap();
    db.append(AppendCommand::new(
        "c",
        ExpectedVersion::NoStream,
        vec![EventRecord::new(rev(1), "Deposited", b"{\"amount\":".to_vec())],
    ))
    .await
    .unwrap();
    common::deposit(&db, "d", &[4]).await;
    common::linearize_all(&db).await;

    // Flip the payload of d@1 behind the store's back.
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE events SET payload = ? WHERE stream_id = ? AND version = ?",
            params![b"{\"amount\":5}".to_vec(), "d", 1],
        )
        .unwrap();
    }

    let fetched = db.fetch(ContractFilter::All, GlobalPos::START, 10).await.unwrap();
    assert_eq!(fetched.len(), 4);
    assert!(fetched[0].envelope().is_some());

    let errors: Vec<&Error> = fetched[1..]
        .iter()
        .map(|f| match f {
            FetchedEvent::Failed(failed) => &failed.error,
            FetchedEvent::Delivered(e) => panic!("unexpected delivery at {}", e.global_position),
            FetchedEvent::Deleted(d) => panic!("unexpected tombstone at {}", d.global_position),
        })
        .collect();
    assert!(matches!(errors[0], Error::UnknownContract { contract_name } if contract_name == "NeverRegistered"));
    assert!(matches!(errors[1], Error::Serialization(_)));
    assert!(matches!(errors[2], Error::Corruption(_)));
    assert!(errors[0].is_decoding());
    assert!(!errors[0].is_conflict());

    db.shutdown().await;
}
