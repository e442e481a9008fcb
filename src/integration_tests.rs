/// # Integration Tests Module
///
/// End-to-end tests of a session against SQLite: filter translation,
/// transaction accounting, savepoints, hooks, shaping and caching working
/// together.

#[cfg(test)]
mod tests {
    use crate::core::db::query::Value;
    use crate::core::SessionError;
    use crate::filters::{Fields, Filters, Operator, OrderBy, Predicate};
    use crate::hooks::RollbackObserver;
    use crate::session::{ExecuteOptions, LookupOptions, Session};
    use crate::shaper::{LookupValue, QueryOutput, Record};
    use crate::test_utils::error_testing::{assert_error_mentions, assert_error_type};
    use crate::test_utils::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_predicate_map_lookup_returns_full_mappings() {
        let mut session = memory_session();
        let filters = Filters::from_json(&json!({"balance": [">", "0"], "status": 1})).unwrap();

        let out = session
            .lookup("accounts", &filters, &Fields::from(["*"]), &LookupOptions::default())
            .unwrap();
        let records = out.records();
        assert_eq!(records.len(), 3);
        // Most recently modified first
        let names: Vec<_> = records.iter().filter_map(|r| r.get("name").and_then(Value::as_str)).collect();
        assert_eq!(names, vec!["ACC-002", "ACC-003", "ACC-001"]);
        assert!(records.iter().all(|r| r.len() == 5));
    }

    #[test]
    fn test_empty_not_in_sums_every_row() {
        let mut session = memory_session();
        let filters = Filters::from_json(&json!({"name": ["not in", []]})).unwrap();
        let total = session
            .get_value("accounts", &filters, &Fields::one("sum(balance)"), &LookupOptions::unordered())
            .unwrap();
        assert_eq!(total, Some(LookupValue::Scalar(Value::Integer(475))));

        let filters = Filters::by("name", Predicate::is_in(Vec::<Value>::new()));
        let out = session
            .lookup("accounts", &filters, &Fields::All, &LookupOptions::default())
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_key_list_ignores_null_and_empty_keys() {
        let mut session = memory_session();
        let fields = Fields::from(["name", "balance"]);
        let options = LookupOptions {
            order_by: OrderBy::from("name asc"),
            ..LookupOptions::default()
        };

        let clean = session
            .lookup("accounts", &Filters::keys(["ACC-001", "ACC-003"]), &fields, &options)
            .unwrap();
        let noisy = session
            .lookup(
                "accounts",
                &Filters::KeyList(vec![Value::Null, Value::from("ACC-001"), Value::from(""), Value::from("ACC-003")]),
                &fields,
                &options,
            )
            .unwrap();
        assert_eq!(clean, noisy);
        assert_eq!(clean.len(), 2);

        let none = session
            .lookup("accounts", &Filters::KeyList(vec![Value::Null]), &fields, &options)
            .unwrap();
        assert_eq!(none, QueryOutput::Empty);
    }

    #[test]
    fn test_commit_without_writes_opens_fresh_boundary() {
        let mut session = memory_session();
        session.commit().unwrap();
        assert_eq!(session.writes_in_transaction(), 0);
        assert_eq!(account_count(&mut session), 5);
    }

    #[test]
    fn test_write_then_read_in_same_transaction() {
        let mut session = memory_session();
        insert_account(&mut session, "ACC-100", 42).unwrap();
        assert_eq!(session.writes_in_transaction(), 1);
        assert_eq!(balance_of(&mut session, "ACC-100"), Some(42));
    }

    #[test]
    fn test_write_ceiling_rolls_back_everything() {
        let mut session = session_with_ceiling(3, false);
        for i in 0..3 {
            insert_account(&mut session, &format!("NEW-{}", i), 1).unwrap();
        }
        let result = insert_account(&mut session, "NEW-3", 1);
        assert_error_type(&result, |e| matches!(e, SessionError::TooManyWrites { limit: 3 }), "ceiling");
        assert_error_mentions(&result, "reverted");

        assert_eq!(session.writes_in_transaction(), 0);
        assert_eq!(account_count(&mut session), 5);
    }

    #[test]
    fn test_write_ceiling_auto_commit() {
        let mut session = session_with_ceiling(3, true);
        for i in 0..4 {
            insert_account(&mut session, &format!("NEW-{}", i), 1).unwrap();
        }
        // The first three were committed; the fourth opened the next boundary
        assert_eq!(session.writes_in_transaction(), 1);
        session.rollback(None).unwrap();
        assert_eq!(account_count(&mut session), 8);
        assert_eq!(balance_of(&mut session, "NEW-3"), None);
    }

    #[test]
    fn test_savepoint_rollback_keeps_earlier_work() {
        let mut session = memory_session();
        insert_account(&mut session, "EARLY", 1).unwrap();
        session.savepoint("before_late").unwrap();
        insert_account(&mut session, "LATE", 2).unwrap();

        session.rollback(Some("before_late")).unwrap();
        assert_eq!(balance_of(&mut session, "EARLY"), Some(1));
        assert_eq!(balance_of(&mut session, "LATE"), None);
        assert_eq!(session.savepoints(), &["before_late".to_string()]);

        session.release_savepoint("before_late").unwrap();
        assert!(session.savepoints().is_empty());
        session.commit().unwrap();
        assert_eq!(balance_of(&mut session, "EARLY"), Some(1));
    }

    #[test]
    fn test_raw_savepoint_statements_track_the_stack() {
        let mut session = memory_session();
        let options = ExecuteOptions::default();
        session.execute("SAVEPOINT outer_sp", (), &options).unwrap();
        insert_account(&mut session, "RAW-1", 1).unwrap();
        session.execute("SAVEPOINT inner_sp", (), &options).unwrap();
        insert_account(&mut session, "RAW-2", 2).unwrap();
        assert_eq!(session.savepoints(), &["outer_sp".to_string(), "inner_sp".to_string()]);

        session.execute("ROLLBACK TO SAVEPOINT inner_sp", (), &options).unwrap();
        assert_eq!(balance_of(&mut session, "RAW-2"), None);
        assert_eq!(balance_of(&mut session, "RAW-1"), Some(1));

        session.execute("RELEASE SAVEPOINT inner_sp", (), &options).unwrap();
        assert_eq!(session.savepoints(), &["outer_sp".to_string()]);
        session.execute("RELEASE outer_sp", (), &options).unwrap();
        assert!(session.savepoints().is_empty());
    }

    #[test]
    fn test_scoped_savepoint_survives_boundary_inside_closure() {
        let mut session = memory_session();
        let committed = session
            .with_savepoint(|s| {
                insert_account(s, "INNER", 3)?;
                s.commit()?;
                Ok("done")
            })
            .unwrap();
        assert_eq!(committed, "done");
        assert!(session.savepoints().is_empty());
        assert_eq!(balance_of(&mut session, "INNER"), Some(3));

        session.with_savepoint(|s| s.rollback(None)).unwrap();
        assert!(session.savepoints().is_empty());
    }

    #[test]
    fn test_scoped_savepoint() {
        let mut session = memory_session();
        let result: crate::core::Result<()> = session.with_savepoint(|s| {
            insert_account(s, "SCOPED", 9)?;
            Err(SessionError::Query("validation failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(balance_of(&mut session, "SCOPED"), None);
        assert!(session.savepoints().is_empty());

        let kept = session
            .with_savepoint(|s| {
                insert_account(s, "SCOPED", 9)?;
                Ok(7)
            })
            .unwrap();
        assert_eq!(kept, 7);
        assert_eq!(balance_of(&mut session, "SCOPED"), Some(9));
        assert!(session.savepoints().is_empty());
    }

    #[test]
    fn test_ddl_after_pending_insert_is_refused() {
        let mut session = memory_session();
        insert_account(&mut session, "PENDING", 5).unwrap();

        let result = session.execute("CREATE TABLE audit (x INTEGER)", (), &ExecuteOptions::default());
        assert_error_type(
            &result,
            |e| matches!(e, SessionError::ImplicitCommit { pending_writes: 1, .. }),
            "implicit commit",
        );
        assert_eq!(session.writes_in_transaction(), 1);
        assert_eq!(balance_of(&mut session, "PENDING"), Some(5));
        assert!(!session.table_exists("audit").unwrap());

        assert!(matches!(session.begin(false), Err(SessionError::ImplicitCommit { .. })));
    }

    #[test]
    fn test_commit_hooks_run_once_in_order() {
        let mut session = memory_session();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=2 {
            let log = log.clone();
            session.register_commit_hook(move |s| {
                log.lock().unwrap().push(format!("before-{}", i));
                insert_account(s, &format!("HOOK-{}", i), i)
            });
        }
        let after = log.clone();
        session.enqueue_after_commit(move |s| {
            after.lock().unwrap().push(format!("after-writes-{}", s.writes_in_transaction()));
            Ok(())
        });

        session.commit().unwrap();
        session.commit().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before-1".to_string(), "before-2".to_string(), "after-writes-0".to_string()]
        );
        // Hook writes are part of the committed transaction
        session.rollback(None).unwrap();
        assert_eq!(balance_of(&mut session, "HOOK-2"), Some(2));
    }

    #[test]
    fn test_failing_hook_aborts_commit() {
        let mut session = memory_session();
        insert_account(&mut session, "UNCOMMITTED", 1).unwrap();
        session.register_commit_hook(|_| Err(SessionError::Hook("ledger does not balance".into())));

        let result = session.commit();
        assert!(matches!(result, Err(SessionError::Hook(_))));
        assert_eq!(session.pending_commit_hooks(), 0);
        assert_eq!(session.writes_in_transaction(), 1);

        session.rollback(None).unwrap();
        assert_eq!(balance_of(&mut session, "UNCOMMITTED"), None);
    }

    #[derive(Default)]
    struct RollbackCounter(AtomicUsize);

    impl RollbackObserver for RollbackCounter {
        fn on_rollback(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rollback_notifies_observers_and_drops_hooks() {
        let mut session = memory_session();
        let counter = Arc::new(RollbackCounter::default());
        let fired = Arc::new(AtomicUsize::new(0));

        session.add_rollback_observer(counter.clone());
        let hook_fired = fired.clone();
        session.register_commit_hook(move |_| {
            hook_fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let job_fired = fired.clone();
        session.enqueue_after_commit(move |_| {
            job_fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        session.savepoint("sp_inner").unwrap();
        session.rollback(Some("sp_inner")).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        session.rollback(None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        session.rollback(None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        session.commit().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_commit_clears_rollback_observers() {
        let mut session = memory_session();
        let counter = Arc::new(RollbackCounter::default());
        session.add_rollback_observer(counter.clone());
        session.commit().unwrap();
        session.rollback(None).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_get_value_shapes() {
        let mut session = memory_session();
        let options = LookupOptions::default();

        let balance = session
            .get_value("accounts", &Filters::from("ACC-002"), &Fields::one("balance"), &options)
            .unwrap();
        assert_eq!(balance, Some(LookupValue::Scalar(Value::Integer(250))));

        let pair = session
            .get_value("accounts", &Filters::from("ACC-002"), &Fields::from("owner, balance"), &options)
            .unwrap();
        assert_eq!(pair, Some(LookupValue::Row(vec![Value::from("bob"), Value::Integer(250)])));

        let as_dict = LookupOptions {
            as_dict: true,
            ..LookupOptions::default()
        };
        let record = session
            .get_value("accounts", &Filters::from("ACC-002"), &Fields::one("balance"), &as_dict)
            .unwrap()
            .and_then(LookupValue::into_record)
            .unwrap();
        assert_eq!(record, Record::new().with("balance", 250));

        let missing = session
            .get_value("accounts", &Filters::from("NOPE"), &Fields::one("balance"), &options)
            .unwrap();
        assert_eq!(missing, None);

        // Default ordering picks the most recently modified match
        let latest = session
            .get_value("accounts", &Filters::All, &Fields::one("name"), &options)
            .unwrap();
        assert_eq!(latest, Some(LookupValue::Scalar(Value::from("ACC-005"))));

        let full = session.get("accounts", &Filters::from("ACC-001")).unwrap().unwrap();
        assert_eq!(full.get("owner"), Some(&Value::from("alice")));
    }

    #[test]
    fn test_exists_and_count() {
        let mut session = memory_session();
        assert_eq!(
            session.exists("accounts", &Filters::from("ACC-003")).unwrap(),
            Some(Value::from("ACC-003"))
        );
        assert_eq!(session.exists("accounts", &Filters::from("ACC-999")).unwrap(), None);
        assert_eq!(session.exists("no_such_table", &Filters::from("x")).unwrap(), None);

        assert_eq!(session.count("accounts", &Filters::All, None).unwrap(), 5);
        assert_eq!(
            session
                .count("accounts", &Filters::by("balance", Predicate::op(Operator::Ge, 75)), None)
                .unwrap(),
            3
        );
        assert_eq!(session.count("accounts", &Filters::All, Some("status")).unwrap(), 2);
        assert_eq!(session.count("accounts", &Filters::KeyList(Vec::new()), None).unwrap(), 0);
    }

    #[test]
    fn test_missing_table_and_column() {
        let mut session = memory_session();
        let result = session.lookup("ghosts", &Filters::All, &Fields::All, &LookupOptions::unordered());
        assert!(matches!(result, Err(SessionError::MissingTable(_))));

        let result = session.lookup(
            "accounts",
            &Filters::by("colour", "red"),
            &Fields::All,
            &LookupOptions::unordered(),
        );
        assert!(matches!(result, Err(SessionError::MissingColumn(_))));

        let ignoring = LookupOptions {
            ignore_missing: true,
            ..LookupOptions::unordered()
        };
        let out = session
            .lookup("accounts", &Filters::by("colour", "red"), &Fields::All, &ignoring)
            .unwrap();
        assert_eq!(out, QueryOutput::Empty);
    }

    #[test]
    fn test_invalid_identifier_never_reaches_backend() {
        let mut session = memory_session();
        let result = session.lookup(
            "accounts; DROP TABLE accounts",
            &Filters::All,
            &Fields::All,
            &LookupOptions::unordered(),
        );
        assert!(matches!(result, Err(SessionError::InvalidIdentifier(_))));
        assert_eq!(account_count(&mut session), 5);
    }

    #[test]
    fn test_point_lookup_cache() {
        let mut session = memory_session();
        let cached = LookupOptions {
            cache: true,
            ..LookupOptions::default()
        };
        let first = session
            .get_value("accounts", &Filters::from("ACC-001"), &Fields::one("balance"), &cached)
            .unwrap();
        assert_eq!(first, Some(LookupValue::Scalar(Value::Integer(100))));

        session
            .execute(
                "UPDATE accounts SET balance = 1 WHERE name = 'ACC-001'",
                (),
                &ExecuteOptions::default(),
            )
            .unwrap();

        // Served from the cache without asking the backend
        let second = session
            .get_value("accounts", &Filters::from("ACC-001"), &Fields::one("balance"), &cached)
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(session.cache_stats(), (1, 1));

        // Mapping filters bypass the cache
        let fresh = session
            .get_value("accounts", &Filters::by("name", "ACC-001"), &Fields::one("balance"), &cached)
            .unwrap();
        assert_eq!(fresh, Some(LookupValue::Scalar(Value::Integer(1))));
        assert_eq!(session.cache_stats(), (1, 1));
    }

    #[test]
    fn test_point_lookup_cache_keeps_shapes_apart() {
        let mut session = memory_session();
        let as_dict = LookupOptions {
            cache: true,
            as_dict: true,
            ..LookupOptions::default()
        };
        let plain = LookupOptions {
            cache: true,
            ..LookupOptions::default()
        };
        let balance = Fields::one("balance");
        let key = Filters::from("ACC-001");

        let record = session.get_value("accounts", &key, &balance, &as_dict).unwrap();
        assert_eq!(
            record,
            Some(LookupValue::Record(Record::new().with("balance", 100)))
        );

        let scalar = session.get_value("accounts", &key, &balance, &plain).unwrap();
        assert_eq!(scalar, Some(LookupValue::Scalar(Value::Integer(100))));

        let plucked = session
            .lookup("accounts", &key, &balance, &LookupOptions { pluck: true, ..plain.clone() })
            .unwrap();
        assert_eq!(plucked, QueryOutput::Column(vec![Value::Integer(100)]));
        assert_eq!(session.cache_stats(), (0, 3));

        // Same shape again is a hit
        let again = session.get_value("accounts", &key, &balance, &plain).unwrap();
        assert_eq!(again, scalar);
        assert_eq!(session.cache_stats(), (1, 3));
    }

    #[test]
    fn test_execute_shapes() {
        let mut session = memory_session();
        let sql = "SELECT name, balance FROM accounts WHERE status = :status ORDER BY name LIMIT 2";
        let params = crate::core::db::query::Params::Named(vec![("status".into(), Value::Integer(1))]);

        let rows = session.execute(sql, params.clone(), &ExecuteOptions::default()).unwrap();
        assert_eq!(rows.clone().into_rows()[0], vec![Value::from("ACC-001"), Value::Integer(100)]);

        let options = ExecuteOptions {
            as_dict: true,
            update: Some(Record::new().with("doctype", "Account")),
            ..ExecuteOptions::default()
        };
        let dicts = session.execute(sql, params.clone(), &options).unwrap();
        assert_eq!(dicts.records()[1].get("doctype"), Some(&Value::from("Account")));

        let utf8 = ExecuteOptions {
            as_utf8: true,
            ..ExecuteOptions::default()
        };
        let bytes = session.execute(sql, params, &utf8).unwrap().into_rows();
        assert_eq!(bytes[0][0], Value::Blob(b"ACC-001".to_vec()));

        let names = session.sql_list("SELECT name FROM accounts WHERE balance = 0", ()).unwrap();
        assert_eq!(names, vec![Value::from("ACC-004")]);

        let nothing = session
            .execute("UPDATE accounts SET status = 1 WHERE name = 'x'", (), &ExecuteOptions::as_dict())
            .unwrap();
        assert_eq!(nothing, QueryOutput::Empty);
    }

    #[test]
    fn test_execute_debug_and_explain_options() {
        let mut session = memory_session();
        let options = ExecuteOptions {
            debug: true,
            explain: true,
            ..ExecuteOptions::default()
        };
        let out = session
            .execute("SELECT name FROM accounts WHERE name = ?", Value::from("ACC-001"), &options)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_execute_auto_commit() {
        let fixture = FileFixture::new().unwrap();
        let mut writer = fixture.session().unwrap();
        let options = ExecuteOptions {
            auto_commit: true,
            ..ExecuteOptions::default()
        };
        writer
            .execute("UPDATE accounts SET balance = 5 WHERE name = 'ACC-004'", (), &options)
            .unwrap();
        assert_eq!(writer.writes_in_transaction(), 0);
        writer.close();

        let mut reader = fixture.session().unwrap();
        assert_eq!(balance_of(&mut reader, "ACC-004"), Some(5));
    }

    #[test]
    fn test_uncommitted_work_is_discarded_on_close() {
        let fixture = FileFixture::new().unwrap();
        let mut writer = fixture.session().unwrap();
        insert_account(&mut writer, "GHOST", 1).unwrap();
        writer.close();

        let mut reader = fixture.session().unwrap();
        assert_eq!(balance_of(&mut reader, "GHOST"), None);
        assert_eq!(account_count(&mut reader), 5);
    }

    #[test]
    fn test_read_only_modes() {
        let fixture = FileFixture::new().unwrap();

        let mut session = fixture.session().unwrap();
        session.begin(true).unwrap();
        let result = insert_account(&mut session, "RO", 1);
        assert!(matches!(result, Err(SessionError::ReadOnly(_))));
        session.rollback(None).unwrap();
        insert_account(&mut session, "RW", 1).unwrap();
        session.commit().unwrap();

        let mut reader = fixture.read_only_session().unwrap();
        assert_eq!(balance_of(&mut reader, "RW"), Some(1));
        assert!(matches!(
            insert_account(&mut reader, "RO", 1),
            Err(SessionError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_schema_helpers_and_invalidation() {
        let mut session = memory_session();
        assert_eq!(session.get_tables().unwrap(), vec!["accounts"]);
        assert!(session.table_exists("accounts").unwrap());
        assert!(session.has_column("accounts", "balance").unwrap());
        assert!(!session.has_column("accounts", "colour").unwrap());
        assert_eq!(
            session.get_column_type("accounts", "balance").unwrap().as_deref(),
            Some("INTEGER")
        );
        assert!(matches!(
            session.get_table_columns("ghosts"),
            Err(SessionError::MissingTable(_))
        ));

        session.sql_ddl("ALTER TABLE accounts ADD COLUMN colour TEXT").unwrap();
        session.sql_ddl("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER)").unwrap();
        assert!(session.has_column("accounts", "colour").unwrap());
        assert_eq!(session.get_tables().unwrap(), vec!["accounts", "ledger"]);
    }

    #[test]
    fn test_rollback_forgets_uncommitted_schema() {
        let mut session = memory_session();
        assert!(!session.table_exists("journal").unwrap());

        session
            .execute("CREATE TABLE journal (id INTEGER PRIMARY KEY)", (), &ExecuteOptions::default())
            .unwrap();
        assert!(session.table_exists("journal").unwrap());
        session.rollback(None).unwrap();
        assert!(!session.table_exists("journal").unwrap());

        session.savepoint("schema_sp").unwrap();
        session
            .execute("CREATE TABLE journal (id INTEGER PRIMARY KEY)", (), &ExecuteOptions::default())
            .unwrap();
        assert!(session.has_column("journal", "id").unwrap());
        session.rollback(Some("schema_sp")).unwrap();
        assert!(!session.table_exists("journal").unwrap());
        assert!(matches!(
            session.get_table_columns("journal"),
            Err(SessionError::MissingTable(_))
        ));
    }

    #[test]
    fn test_bulk_insert_chunks_and_duplicates() {
        let mut session = memory_session();
        session
            .sql_ddl("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER)")
            .unwrap();

        let rows: Vec<Vec<Value>> = (1..=25).map(|i| vec![Value::from(i), Value::from(i * 10)]).collect();
        let sent = session
            .bulk_insert_in_chunks("ledger", &["id", "amount"], &rows, false, 10)
            .unwrap();
        assert_eq!(sent, 25);
        assert_eq!(session.writes_in_transaction(), 3);

        let dupes = vec![vec![Value::from(1), Value::from(0)], vec![Value::from(26), Value::from(260)]];
        assert!(session.bulk_insert("ledger", &["id", "amount"], &dupes, false).is_err());
        session.bulk_insert("ledger", &["id", "amount"], &dupes, true).unwrap();

        assert_eq!(session.count("ledger", &Filters::All, None).unwrap(), 26);
        let total = session
            .get_value("ledger", &Filters::All, &Fields::one("sum(amount)"), &LookupOptions::unordered())
            .unwrap();
        assert_eq!(total, Some(LookupValue::Scalar(Value::Integer(3510))));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut a = memory_session();
        let mut b = Session::open(crate::config::SessionConfig::in_memory()).unwrap();
        insert_account(&mut a, "ONLY-A", 1).unwrap();
        assert_eq!(a.writes_in_transaction(), 1);
        assert_eq!(b.writes_in_transaction(), 0);
        assert!(!b.table_exists("accounts").unwrap());
    }
}
