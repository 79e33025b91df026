use loamdb::{Db, Options};
use tempdir::TempDir;

fn open(temp: &TempDir, page_size: usize) -> Db {
    Db::open(&temp.path().join("test.db"), Options { page_size, ..Default::default() }).unwrap()
}

#[test]
fn roundtrips_after_reopen_with_a_non_default_page_size() {
    let temp = TempDir::new("loamdb").unwrap();
    let path = temp.path().join("test.db");

    {
        let db = Db::open(&path, Options { page_size: 1024, ..Default::default() }).unwrap();
        db.update(|tx| {
            let mut root = tx.root_bucket();
            root.put(b"alpha".to_vec(), b"1".to_vec())?;
            root.put(b"beta".to_vec(), b"2".to_vec())?;
            Ok(())
        })
        .unwrap();
    }

    let db = Db::open(&path, Options { page_size: 1024, ..Default::default() }).unwrap();
    db.view(|tx| {
        let root = tx.root_bucket();
        assert_eq!(root.get(b"alpha")?, Some(b"1".to_vec()));
        assert_eq!(root.get(b"beta")?, Some(b"2".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn each_view_is_pinned_to_the_txid_committed_before_it_opened() {
    let temp = TempDir::new("loamdb").unwrap();
    let db = open(&temp, 4096);

    db.update(|tx| {
        tx.root_bucket().put(b"k".to_vec(), b"old".to_vec())?;
        Ok(())
    })
    .unwrap();

    let txid_before = db.view(|snapshot| {
        assert_eq!(snapshot.root_bucket().get(b"k")?, Some(b"old".to_vec()));
        Ok(snapshot.txid())
    })
    .unwrap();

    db.update(|tx| {
        tx.root_bucket().put(b"k".to_vec(), b"new".to_vec())?;
        Ok(())
    })
    .unwrap();

    // A view opened after the second commit sees the new value and a
    // strictly newer txid than one opened before it.
    db.view(|tx| {
        assert_eq!(tx.root_bucket().get(b"k")?, Some(b"new".to_vec()));
        assert!(tx.txid() > txid_before);
        Ok(())
    })
    .unwrap();
}

#[test]
fn bulk_write_and_ascending_iteration_order() {
    let temp = TempDir::new("loamdb").unwrap();
    let db = open(&temp, 4096);

    const COUNT: u32 = 10_000;
    db.update(|tx| {
        let mut root = tx.root_bucket();
        for i in 0..COUNT {
            let key = format!("key-{i:06}").into_bytes();
            let value = i.to_le_bytes().to_vec();
            root.put(key, value)?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let root = tx.root_bucket();
        let mut prev: Option<Vec<u8>> = None;
        let mut seen = 0u32;
        for entry in root.iter()? {
            let (key, _value) = entry?;
            if let Some(p) = &prev {
                assert!(*p < key, "iteration order must be strictly ascending");
            }
            prev = Some(key);
            seen += 1;
        }
        assert_eq!(seen, COUNT);
        Ok(())
    })
    .unwrap();
}

#[test]
fn wal_survives_records_of_varying_length_across_a_reopen() {
    let temp = TempDir::new("loamdb").unwrap();
    let path = temp.path().join("test.db");
    let lengths = [0usize, 3, 10, 11, 12, 100_000];

    {
        let db = Db::open(&path, Options::default()).unwrap();
        db.update(|tx| {
            let mut root = tx.root_bucket();
            for (i, len) in lengths.iter().enumerate() {
                root.put(format!("len-{i}").into_bytes(), vec![0xAB; *len])?;
            }
            Ok(())
        })
        .unwrap();
    }

    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        let root = tx.root_bucket();
        for (i, len) in lengths.iter().enumerate() {
            let got = root.get(format!("len-{i}").as_bytes())?.unwrap();
            assert_eq!(got.len(), *len);
            assert!(got.iter().all(|&b| b == 0xAB));
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn reopening_after_a_simulated_crash_replays_the_committed_write() {
    let temp = TempDir::new("loamdb").unwrap();
    let path = temp.path().join("test.db");

    {
        let db = Db::open(&path, Options::default()).unwrap();
        db.update(|tx| {
            tx.root_bucket().put(b"durable".to_vec(), b"yes".to_vec())?;
            Ok(())
        })
        .unwrap();
        // `db` is dropped here without any explicit close/checkpoint call,
        // standing in for the process exiting right after a commit synced.
    }

    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        assert_eq!(tx.root_bucket().get(b"durable")?, Some(b"yes".to_vec()));
        Ok(())
    })
    .unwrap();
}

#[test]
fn sub_bucket_survives_a_reopen_and_is_fully_freed_on_delete() {
    let temp = TempDir::new("loamdb").unwrap();
    let path = temp.path().join("test.db");

    {
        let db = Db::open(&path, Options::default()).unwrap();
        db.update(|tx| {
            let mut root = tx.root_bucket();
            let mut widgets = root.sub_bucket(b"widgets")?;
            widgets.put(b"sprocket".to_vec(), b"1".to_vec())?;
            widgets.put(b"gear".to_vec(), vec![0u8; 4096])?;
            Ok(())
        })
        .unwrap();
    }

    {
        let db = Db::open(&path, Options::default()).unwrap();
        db.view(|tx| {
            let root = tx.root_bucket();
            let widgets = root.sub_bucket(b"widgets")?.unwrap();
            assert_eq!(widgets.get(b"sprocket")?, Some(b"1".to_vec()));
            assert_eq!(widgets.get(b"gear")?.map(|v| v.len()), Some(4096));
            Ok(())
        })
        .unwrap();

        db.update(|tx| {
            tx.root_bucket().delete_sub_bucket(b"widgets")?;
            Ok(())
        })
        .unwrap();
    }

    let db = Db::open(&path, Options::default()).unwrap();
    db.view(|tx| {
        assert!(tx.root_bucket().sub_bucket(b"widgets")?.is_none());
        Ok(())
    })
    .unwrap();
}
