use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rnfleet::account::{Account, AccountPool};
use rnfleet::config::QueueConfig;
use rnfleet::connection::{VirtualConnector, VirtualDevice};
use rnfleet::error::FleetError;
use rnfleet::host::Host;
use rnfleet::logger::{JobEvent, JobLogger, RecordLevel};
use rnfleet::queue::Queue;

const RECORDED_RUN: &str = include_str!("fixtures/fleet_run_two_hosts.jsonl");

fn lenient_device(host: &Host) -> Result<VirtualDevice, FleetError> {
    let mut device = VirtualDevice::new(host.name()).with_strict(false);
    device.add_response("^show version$", format!("{} uptime is 3 weeks", host.name()))?;
    Ok(device)
}

#[test]
fn five_jobs_on_two_accounts_all_finish() {
    let connector = VirtualConnector::new(|host: &Host| {
        let device = lenient_device(host)?;
        if host.name() == "r5" {
            return Ok(device.with_credentials("nobody", "nothing"));
        }
        Ok(device)
    });
    let queue = Queue::new(connector.clone(), QueueConfig::default().with_max_threads(2))
        .expect("queue");
    let pool = Arc::new(AccountPool::with_accounts([
        Account::new("alice", "a-secret"),
        Account::new("bob", "b-secret"),
    ]));
    queue.add_account_pool(pool.clone(), None);

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let max_locked = Arc::new(AtomicUsize::new(0));
    let task = {
        let (active, max_active, max_locked, pool) =
            (active.clone(), max_active.clone(), max_locked.clone(), pool.clone());
        queue
            .run(
                ["r1", "r2", "r3", "r4", "r5"],
                move |_, _, session| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    max_locked.fetch_max(pool.n_accounts() - pool.n_unlocked(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    let result = session.execute("show version");
                    active.fetch_sub(1, Ordering::SeqCst);
                    result.map(|_| ())
                },
                Some(2),
            )
            .expect("run")
            .expect("task")
    };

    assert!(!task.wait());
    let progress = queue.progress();
    assert_eq!(progress.completed + progress.failed, 5);
    assert_eq!(progress.completed, 4);
    assert_eq!(progress.pending, 0);
    assert!(max_active.load(Ordering::SeqCst) <= 2);
    assert!(max_locked.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.n_unlocked(), 2);

    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].name, "r5");
    assert_eq!(failures[0].attempts, 2);
    assert!(failures[0].error.contains("authentication failed"));
    // Four successful sessions and two login attempts on r5.
    assert_eq!(connector.connections(), 6);
}

#[test]
fn hosts_are_routed_to_matching_pools() {
    let connector = VirtualConnector::new(|host: &Host| {
        let device = lenient_device(host)?;
        Ok(if host.name().starts_with("core") {
            device.with_credentials("core-admin", "c0re")
        } else {
            device.with_credentials("admin", "secret")
        })
    });
    let queue = Queue::new(connector, QueueConfig::default().with_max_threads(3)).expect("queue");
    queue.add_account(Account::new("admin", "secret"));
    queue.add_account_pool(
        Arc::new(AccountPool::with_accounts([Account::new("core-admin", "c0re")])),
        Some(Box::new(|host: &Host| host.name().starts_with("core"))),
    );

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let sink = seen.clone();
    let task = queue
        .run(
            ["core-1", "edge-1", "core-2", "edge-2"],
            move |_, _, session| {
                let output = session.execute("show version")?;
                sink.lock().expect("seen").insert(output);
                Ok(())
            },
            None,
        )
        .expect("run")
        .expect("task");

    assert!(task.wait());
    assert!(queue.failures().is_empty());
    let seen = seen.lock().expect("seen");
    assert!(seen.contains("core-2 uptime is 3 weeks"));
    assert!(seen.contains("edge-1 uptime is 3 weeks"));
}

#[test]
fn attached_account_wins_over_pools() {
    let connector = VirtualConnector::new(|host: &Host| {
        Ok(lenient_device(host)?.with_credentials("special", "sp3cial"))
    });
    let queue = Queue::new(connector, QueueConfig::default()).expect("queue");
    let special = queue.add_account(Account::new("special", "sp3cial"));
    queue.add_account(Account::new("admin", "secret"));

    let host = Host::new("lab-1").with_account(special);
    let task = queue
        .run([host], |_, _, _| Ok(()), None)
        .expect("run")
        .expect("task");
    assert!(task.wait());
}

#[test]
fn device_is_recognized_from_its_banners() {
    let connector = VirtualConnector::new(|host: &Host| {
        let device = lenient_device(host)?;
        Ok(match host.name() {
            "mx1" => device
                .with_banner("--- JUNOS 20.4R3 built 2021-08-26 ---\n")
                .with_prompt("admin@mx1> "),
            _ => device.with_protocol_banner("SSH-2.0-Cisco-1.25"),
        })
    });
    let queue = Queue::new(connector, QueueConfig::default().with_max_threads(2)).expect("queue");
    queue.add_account(Account::new("admin", "secret"));

    let drivers = Arc::new(Mutex::new(Vec::new()));
    let sink = drivers.clone();
    let task = queue
        .run(
            ["mx1", "r1"],
            move |_, host, session| {
                sink.lock().expect("drivers").push((
                    host.name().to_string(),
                    session.driver().name().to_string(),
                    session.guess_os().to_string(),
                ));
                Ok(())
            },
            None,
        )
        .expect("run")
        .expect("task");
    assert!(task.wait());

    let mut drivers = drivers.lock().expect("drivers").clone();
    drivers.sort();
    assert_eq!(
        drivers,
        vec![
            ("mx1".to_string(), "junos".to_string(), "junos".to_string()),
            ("r1".to_string(), "ios".to_string(), "ios".to_string()),
        ]
    );
}

#[test]
fn recorded_run_exports_and_reloads() {
    let connector = VirtualConnector::new(|host: &Host| lenient_device(host));
    let config = QueueConfig::default()
        .with_max_threads(2)
        .with_record_level(RecordLevel::Full);
    let queue = Queue::new(connector, config).expect("queue");
    queue.add_account(Account::new("admin", "secret"));
    queue.add_account(Account::new("backup", "secret"));

    let task = queue
        .run(["r1", "r2"], |_, _, session| session.execute("show version").map(|_| ()), None)
        .expect("run")
        .expect("task");
    assert!(task.wait());

    let logger = queue.logger().expect("logger");
    let jsonl = logger.to_jsonl().expect("export");
    let reloaded = JobLogger::from_jsonl(&jsonl).expect("reload");
    assert_eq!(reloaded.entries().expect("entries"), logger.entries().expect("entries"));

    let transcripts = reloaded.transcripts().expect("transcripts");
    for id in task.job_ids() {
        assert!(transcripts[id].contains("uptime is 3 weeks"));
        assert_eq!(
            reloaded.job_events(*id).expect("events").last(),
            Some(&JobEvent::JobSucceeded)
        );
    }
}

#[test]
fn fixture_reconstructs_per_job_transcripts() {
    let logger = JobLogger::from_jsonl(RECORDED_RUN).expect("load fixture");
    let transcripts = logger.transcripts().expect("transcripts");
    assert_eq!(transcripts[&1], "Welcome to r1!\nUser: admin\nPassword: \nr1> ");
    assert!(transcripts[&2].ends_with("Login failed\nUser: "));

    let events = logger.job_events(2).expect("events");
    assert_eq!(
        events.first(),
        Some(&JobEvent::JobStarted {
            name: "r2".to_string(),
            attempt: 1
        })
    );
    assert!(matches!(events.last(), Some(JobEvent::JobAborted { error }) if error.contains("authentication")));
}

#[test]
fn queue_survives_shutdown_but_not_destroy() {
    let connector = VirtualConnector::new(|host: &Host| lenient_device(host));
    let queue = Queue::new(connector, QueueConfig::default()).expect("queue");
    queue.add_account(Account::new("admin", "secret"));

    queue.shutdown(false);
    let task = queue
        .run(["r1"], |_, _, _| Ok(()), None)
        .expect("run after shutdown")
        .expect("task");
    assert!(task.wait());

    queue.destroy(false);
    assert!(matches!(
        queue.run(["r1"], |_, _, _| Ok(()), None),
        Err(FleetError::PipelineClosed)
    ));
}
