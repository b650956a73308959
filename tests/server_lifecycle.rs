//! End-to-end scenarios across the store, the supervisor and the command
//! surface: lease hand-off between competing workers, resurrection across a
//! process restart, namespace-rename protection while a worker is active,
//! and query-test isolation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use webacquire::config::ServerSettings;
use webacquire::models::{ModuleKind, ThreadOptions};
use webacquire::repository::{ListTables, Store};
use webacquire::server::commands::{self, Handled};
use webacquire::workers::supervisor::Supervisor;

fn settings() -> ServerSettings {
    ServerSettings {
        port: 0,
        allowed_clients: "127.0.0.1".to_string(),
        logs_deletable: true,
        data_deletable: true,
    }
}

fn seeded_website(store: &mut Store) -> (u64, u64, ListTables) {
    let website = store.add_website("News", "news", "example.com").unwrap();
    let list = store.add_url_list(website, "Main", "main").unwrap();
    (website, list, ListTables::new("news", "main"))
}

#[test]
fn lease_hand_off_between_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite3");
    let mut store = Store::open(&db).unwrap();
    store.init_schema().unwrap();
    let (_, _, tables) = seeded_website(&mut store);
    let url_id = store.add_url(&tables, "/", true).unwrap();

    // two workers race for the same URL; the lease admits exactly one
    let db_a = db.clone();
    let db_b = db.clone();
    let tables_a = tables.clone();
    let tables_b = tables.clone();
    let worker = |db: std::path::PathBuf, tables: ListTables| {
        std::thread::spawn(move || {
            let mut store = Store::open(&db).unwrap();
            store
                .lock_url(&tables, ModuleKind::Crawler, url_id, Duration::from_secs(5))
                .unwrap()
        })
    };
    let first = worker(db_a, tables_a).join().unwrap();
    let second = worker(db_b, tables_b).join().unwrap();

    let winners = [&first, &second].iter().filter(|l| l.is_some()).count();
    assert_eq!(winners, 1, "exactly one worker may hold the lease");

    // the winner finishes and releases; the lock column ends up empty
    let expiry = first.or(second).unwrap();
    assert!(store
        .finish_url(&tables, ModuleKind::Crawler, url_id, &expiry)
        .unwrap());
    store
        .release_url(&tables, ModuleKind::Crawler, url_id, &expiry)
        .unwrap();
    assert!(store
        .get_url_lock(&tables, ModuleKind::Crawler, url_id)
        .unwrap()
        .is_none());
    assert!(store
        .is_url_finished(&tables, ModuleKind::Crawler, url_id)
        .unwrap());
}

#[test]
fn resurrection_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite3");
    let options;
    let tables;
    {
        let mut store = Store::open(&db).unwrap();
        store.init_schema().unwrap();
        let (website, list, t) = seeded_website(&mut store);
        tables = t;
        for i in 0..5 {
            store.add_url(&tables, &format!("/page{i}"), false).unwrap();
        }
        let config = store
            .add_configuration(
                website,
                "extractor",
                "default",
                r#"[{"cat":"general","name":"sleep.idle","value":50}]"#,
            )
            .unwrap();
        options = ThreadOptions {
            website,
            url_list: list,
            config,
        };
    }

    // first run: start an extractor, let it work, interrupt it
    let thread_id;
    {
        let mut supervisor = Supervisor::new(&db, settings()).unwrap();
        thread_id = supervisor
            .start_worker(ModuleKind::Extractor, options)
            .unwrap();
        std::thread::sleep(Duration::from_millis(400));
        supervisor.shutdown();
    }
    {
        let mut store = Store::open(&db).unwrap();
        let rows = store.get_threads().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, thread_id);
        assert!(
            rows[0].status.starts_with("INTERRUPTED"),
            "status after interrupt: {}",
            rows[0].status
        );
    }

    // second run: exactly one worker per surviving row, resuming its cursor
    {
        let supervisor = Supervisor::new(&db, settings()).unwrap();
        assert_eq!(supervisor.workers().len(), 1);
        assert_eq!(supervisor.workers()[0].id(), thread_id);

        let mut store = Store::open(&db).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = store
                .next_url(&tables, ModuleKind::Extractor, 0, false)
                .unwrap();
            if remaining.is_none() || Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let mut supervisor = supervisor;
        supervisor.shutdown();

        assert!(store
            .next_url(&tables, ModuleKind::Extractor, 0, false)
            .unwrap()
            .is_none());
    }
}

#[test]
fn namespace_change_rejected_while_crawler_is_active() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite3");
    let website;
    let options;
    {
        let mut store = Store::open(&db).unwrap();
        store.init_schema().unwrap();
        let (w, list, _) = seeded_website(&mut store);
        website = w;
        let links = store
            .add_query(
                website,
                "links",
                "//a/@href",
                webacquire::models::QueryKind::XPath,
                false,
                false,
                true,
                false,
            )
            .unwrap();
        // short timeouts keep the worker's doomed fetch attempts brief
        let body = format!(
            r#"[{{"cat":"crawler","name":"queries.links","value":[{links}]}},
                {{"cat":"crawler","name":"sleep.error","value":100}},
                {{"cat":"crawler","name":"sleep.idle","value":50}},
                {{"cat":"network","name":"timeout","value":1}},
                {{"cat":"network","name":"timeout.request","value":1}}]"#
        );
        let config = store
            .add_configuration(website, "crawler", "default", &body)
            .unwrap();
        options = ThreadOptions {
            website,
            url_list: list,
            config,
        };
    }

    let mut supervisor = Supervisor::new(&db, settings()).unwrap();
    supervisor.start_worker(ModuleKind::Crawler, options).unwrap();
    let shared = Arc::new(Mutex::new(supervisor));

    let body = format!(
        r#"{{"cmd":"updatewebsite","id":{website},"name":"News","namespace":"ns_b","domain":"example.com"}}"#
    );
    let response = match commands::handle(&shared, "127.0.0.1", &body) {
        Handled::Done(response) => response,
        Handled::Async(_) => panic!("updatewebsite is synchronous"),
    };
    assert!(response.fail);
    assert!(
        response.text.contains("while crawler is active"),
        "unexpected text: {}",
        response.text
    );

    // the namespace stayed untouched
    {
        let mut sup = shared.lock().unwrap();
        assert_eq!(sup.store().get_website_namespace(website).unwrap(), "news");
        sup.shutdown();
    }
}

#[test]
fn failed_initialization_is_reaped_and_frees_the_entity() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite3");
    let website;
    let options;
    {
        let mut store = Store::open(&db).unwrap();
        store.init_schema().unwrap();
        let (w, list, _) = seeded_website(&mut store);
        website = w;
        // parser configuration without a result table: initialization fails
        let config = store
            .add_configuration(website, "parser", "default", "[]")
            .unwrap();
        options = ThreadOptions {
            website,
            url_list: list,
            config,
        };
    }

    let mut supervisor = Supervisor::new(&db, settings()).unwrap();
    supervisor.start_worker(ModuleKind::Parser, options).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !supervisor.workers()[0].is_terminated() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(supervisor.workers()[0].is_terminated());
    assert!(supervisor
        .workers()[0]
        .status()
        .starts_with("FAILED"));

    // the next supervisor tick reaps the worker; the website is free again
    supervisor.tick();
    assert!(supervisor.workers().is_empty());
    assert!(supervisor.website_busy(website).is_none());

    supervisor.shutdown();
}

#[test]
fn query_test_runs_on_a_worker_thread() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite3");
    {
        let mut store = Store::open(&db).unwrap();
        store.init_schema().unwrap();
    }
    let supervisor = Supervisor::new(&db, settings()).unwrap();
    let shared = Arc::new(Mutex::new(supervisor));

    let body = r#"{"cmd":"testquery","name":"t","query":"p\\d+","type":"regex",
        "resultbool":true,"resultsingle":true,"resultmulti":true,"textonly":false,
        "text":"p1 p2 p3"}"#;
    let receiver = match commands::handle(&shared, "127.0.0.1", body) {
        Handled::Async(receiver) => receiver,
        Handled::Done(response) => panic!("expected async dispatch, got: {:?}", response.text),
    };

    // the endpoint stays responsive while the test thread runs
    let log_body = r#"{"cmd":"log","entry":"still responsive"}"#;
    match commands::handle(&shared, "127.0.0.1", log_body) {
        Handled::Done(response) => assert!(!response.fail),
        Handled::Async(_) => panic!("log is synchronous"),
    }

    let response = receiver.blocking_recv().unwrap();
    assert!(!response.fail);
    assert!(response.text.contains("BOOLEAN RESULT"));
    assert!(response.text.contains("[3] p3"));

    // the supervisor tick joins the concluded query-test thread
    let mut sup = shared.lock().unwrap();
    sup.tick();
    sup.shutdown();
}
