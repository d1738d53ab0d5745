mod common;

use std::time::Duration;

use common::{rev, Deposited, Withdrawn};
use eventline::{AppendCommand, Error, ExpectedVersion, RecordKind, StreamRev};

#[tokio::test]
async fn appended_events_load_back_in_version_order() {
    let (_dir, _path, db) = common::open_temp_db("append_load.db").await;

    let result = common::deposit(&db, "account-1", &[10, 20, 30]).await;
    assert_eq!(result.first_version, rev(1));
    assert_eq!(result.last_version, rev(3));
    assert_eq!(db.head_version("account-1").await.unwrap(), rev(3));

    let events = db.load("account-1", StreamRev::FIRST).await.unwrap();
    assert_eq!(events.len(), 3);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.version.as_raw(), i as u64 + 1);
        assert_eq!(event.kind, RecordKind::Event);
        assert_eq!(event.contract_name, "Deposited");
    }

    let amounts: Vec<i64> = events
        .iter()
        .map(|e| {
            serde_json::from_slice::<Deposited>(&e.payload)
                .unwrap()
                .amount
        })
        .collect();
    assert_eq!(amounts, vec![10, 20, 30]);

    // Loading from the middle, and from version 0, which means the start.
    let tail = db.load("account-1", rev(2)).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].version, rev(2));
    let all = db.load("account-1", StreamRev::NONE).await.unwrap();
    assert_eq!(all.len(), 3);

    db.shutdown().await;
}

#[tokio::test]
async fn unknown_stream_loads_empty() {
    let (_dir, _path, db) = common::open_temp_db("empty.db").await;

    assert!(db.load("missing", StreamRev::FIRST).await.unwrap().is_empty());
    let lock = db.load_for_update("missing", StreamRev::FIRST).await.unwrap();
    assert!(lock.events().is_empty());
    assert_eq!(lock.head(), StreamRev::NONE);
    drop(lock);
    assert_eq!(db.head_version("missing").await.unwrap(), StreamRev::NONE);

    db.shutdown().await;
}

#[tokio::test]
async fn wrong_exact_version_leaves_stream_unchanged() {
    let (_dir, _path, db) = common::open_temp_db("exact.db").await;
    common::deposit(&db, "account-1", &[1, 2, 3]).await;

    let record = db.encode(rev(6), &Deposited { amount: 99 }).unwrap();
    let err = db
        .append(AppendCommand::new(
            "account-1",
            ExpectedVersion::exact(5),
            vec![record],
        ))
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    match err {
        Error::WrongExpectedVersion {
            stream_id,
            expected,
            actual,
            ..
        } => {
            assert_eq!(stream_id, "account-1");
            assert_eq!(expected, ExpectedVersion::exact(5));
            assert_eq!(actual, rev(3));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(db.head_version("account-1").await.unwrap(), rev(3));
    assert_eq!(db.load("account-1", StreamRev::FIRST).await.unwrap().len(), 3);

    db.shutdown().await;
}

#[tokio::test]
async fn no_stream_fails_once_the_stream_exists() {
    let (_dir, _path, db) = common::open_temp_db("no_stream.db").await;
    common::deposit(&db, "account-1", &[1]).await;

    let record = db.encode(rev(1), &Deposited { amount: 2 }).unwrap();
    let err = db
        .append(AppendCommand::new("account-1", ExpectedVersion::NoStream, vec![record]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    db.shutdown().await;
}

#[tokio::test]
async fn any_requires_the_next_version() {
    let (_dir, _path, db) = common::open_temp_db("any.db").await;
    common::deposit(&db, "account-1", &[1, 2]).await;

    // Claims version 2, which is taken.
    let stale = db.encode(rev(2), &Deposited { amount: 3 }).unwrap();
    let err = db
        .append(AppendCommand::new("account-1", ExpectedVersion::Any, vec![stale]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Claims version 4, which would leave a gap.
    let gap = db.encode(rev(4), &Deposited { amount: 3 }).unwrap();
    let err = db
        .append(AppendCommand::new("account-1", ExpectedVersion::Any, vec![gap]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let next = db.encode(rev(3), &Deposited { amount: 3 }).unwrap();
    let result = db
        .append(AppendCommand::new("account-1", ExpectedVersion::Any, vec![next]))
        .await
        .unwrap();
    assert_eq!(result.last_version, rev(3));

    db.shutdown().await;
}

#[tokio::test]
async fn malformed_commits_are_rejected() {
    let (_dir, _path, db) = common::open_temp_db("malformed.db").await;

    let err = db
        .append(AppendCommand::new("s", ExpectedVersion::NoStream, vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAppend(_)));
    assert!(!err.is_conflict());

    let records = vec![
        db.encode(rev(1), &Deposited { amount: 1 }).unwrap(),
        db.encode(rev(3), &Deposited { amount: 3 }).unwrap(),
    ];
    let err = db
        .append(AppendCommand::new("s", ExpectedVersion::NoStream, records))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAppend(_)));
    assert_eq!(db.head_version("s").await.unwrap(), StreamRev::NONE);

    db.shutdown().await;
}

#[tokio::test]
async fn lockable_flag_is_fixed_by_the_first_commit() {
    let (_dir, _path, db) = common::open_temp_db("lockable.db").await;

    let first = db.encode(rev(1), &Deposited { amount: 1 }).unwrap();
    db.append(AppendCommand::new("locked", ExpectedVersion::NoStream, vec![first]).lockable())
        .await
        .unwrap();
    common::deposit(&db, "locked", &[2]).await;

    let head = db.stream_head("locked").await.unwrap().unwrap();
    assert!(head.is_lockable);
    assert_eq!(head.version, rev(2));

    // Locked and plain loads see the same data.
    let locked = db.load_for_update("locked", StreamRev::FIRST).await.unwrap();
    let plain = db.load("locked", StreamRev::FIRST).await.unwrap();
    assert_eq!(locked.events(), plain.as_slice());
    drop(locked);

    common::deposit(&db, "plain", &[1]).await;
    assert!(!db.stream_head("plain").await.unwrap().unwrap().is_lockable);
    let err = db.load_for_update("plain", StreamRev::FIRST).await.unwrap_err();
    assert!(matches!(err, Error::StreamNotLockable { ref stream_id } if stream_id == "plain"));

    db.shutdown().await;
}

#[tokio::test]
async fn locked_load_keeps_other_writers_out_until_save() {
    let (_dir, _path, db) = common::open_temp_db("locked_load.db").await;

    let opening = db.encode(rev(1), &Deposited { amount: 100 }).unwrap();
    db.append(AppendCommand::new("acct", ExpectedVersion::NoStream, vec![opening]).lockable())
        .await
        .unwrap();

    // A reads the balance under lock.
    let lock = db.load_for_update("acct", StreamRev::FIRST).await.unwrap();
    assert_eq!(lock.head(), rev(1));
    assert_eq!(lock.events().len(), 1);

    // B tries to land a withdrawal between A's read and A's save.
    let writer_b = db.clone();
    let mut b = tokio::spawn(async move {
        let record = writer_b.encode(rev(2), &Withdrawn { amount: 100 }).unwrap();
        writer_b
            .append(AppendCommand::new("acct", ExpectedVersion::Exact(rev(1)), vec![record]))
            .await
    });
    assert!(tokio::time::timeout(Duration::from_millis(200), &mut b)
        .await
        .is_err());
    assert_eq!(db.head_version("acct").await.unwrap(), rev(1));

    // Other streams are not held up.
    common::deposit(&db, "elsewhere", &[1]).await;

    let record = db.encode(rev(2), &Withdrawn { amount: 60 }).unwrap();
    let saved = lock
        .append(AppendCommand::new("acct", ExpectedVersion::Exact(rev(1)), vec![record]))
        .await
        .unwrap();
    assert_eq!(saved.last_version, rev(2));

    // B ran after A's save and lost.
    assert!(b.await.unwrap().unwrap_err().is_conflict());

    let events = db.load("acct", StreamRev::FIRST).await.unwrap();
    assert_eq!(events.len(), 2);
    let withdrawn: Withdrawn = serde_json::from_slice(&events[1].payload).unwrap();
    assert_eq!(withdrawn.amount, 60);

    db.shutdown().await;
}

#[tokio::test]
async fn dropping_a_lock_lets_waiting_writers_through() {
    let (_dir, _path, db) = common::open_temp_db("lock_drop.db").await;

    let lock = db.load_for_update("fresh", StreamRev::FIRST).await.unwrap();
    let writer_b = db.clone();
    let b = tokio::spawn(async move {
        let record = writer_b.encode(rev(1), &Deposited { amount: 1 }).unwrap();
        writer_b
            .append(AppendCommand::new("fresh", ExpectedVersion::NoStream, vec![record]))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!b.is_finished());

    drop(lock);
    assert_eq!(b.await.unwrap().unwrap().last_version, rev(1));

    db.shutdown().await;
}
