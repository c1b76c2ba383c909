//! End-to-end behavior of the scheduler, the transfer queue and the relay

use crossbeam::channel::{bounded, Sender};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use termcore::config::SchedulerConfig;
use termcore::relay::Relay;
use termcore::scheduler::TaskScheduler;
use termcore::transfer::{
    TransferDirection, TransferError, TransferEvent, TransferQueue, TransferStatus, TransferTask,
};

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn scheduler() -> TaskScheduler {
    TaskScheduler::new(SchedulerConfig::default()).unwrap()
}

/// Transfer that holds its slot until released
fn gated(name: &str) -> (Arc<TransferTask>, Sender<()>) {
    let (release, gate) = bounded::<()>(1);
    let task = TransferTask::from_fn(
        format!("/tmp/{name}"),
        format!("/srv/{name}"),
        TransferDirection::Upload,
        move |ctx| {
            ctx.set_total(100);
            loop {
                ctx.checkpoint()?;
                if gate.recv_timeout(Duration::from_millis(5)).is_ok() {
                    ctx.advance(100);
                    return Ok(());
                }
            }
        },
    );
    (Arc::new(task), release)
}

#[test]
fn once_task_waits_for_its_delay() {
    let scheduler = scheduler();
    let fired_at = Arc::new(Mutex::new(None));
    let scheduled_at = Instant::now();

    let slot = Arc::clone(&fired_at);
    let handle = scheduler
        .schedule_once(
            move |_ctx| {
                *slot.lock().unwrap() = Some(Instant::now());
                Ok(())
            },
            Duration::from_millis(150),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || fired_at.lock().unwrap().is_some()));
    let fired = fired_at.lock().unwrap().unwrap();
    assert!(fired.duration_since(scheduled_at) >= Duration::from_millis(150));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.run_count(), 1);
    assert_eq!(scheduler.live_count(), 0);
}

#[test]
fn cancel_before_fire_means_no_execution() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&runs);
    let handle = scheduler
        .schedule_once(
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(200),
        )
        .unwrap();
    scheduler.cancel(&handle);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(handle.is_cancelled());
}

#[test]
fn loop_runs_about_once_per_period() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&runs);
    let handle = scheduler
        .schedule_loop(
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                Ok(())
            },
            Duration::from_millis(100),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(1000));
    handle.cancel();
    let observed = runs.load(Ordering::SeqCst);

    // Delay after completion: at most duration / period + 1
    assert!((8..=10).contains(&observed), "observed {observed} runs");

    thread::sleep(Duration::from_millis(250));
    assert!(runs.load(Ordering::SeqCst) <= observed + 1);
}

#[test]
fn loop_failures_do_not_stop_the_loop() {
    let scheduler = scheduler();
    let runs = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&runs);
    let handle = scheduler
        .schedule_loop(
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("keep-alive check failed")
            },
            Duration::from_millis(20),
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || runs.load(Ordering::SeqCst) >= 3));
    handle.cancel();
}

#[test]
fn submit_delivers_result_and_failures() {
    let scheduler = scheduler();

    let ok = scheduler.submit(|_ctx| Ok(6 * 7)).unwrap();
    assert_eq!(ok.wait().unwrap(), 42);

    let failed = scheduler
        .submit(|_ctx| -> anyhow::Result<u32> { anyhow::bail!("host unreachable") })
        .unwrap();
    let err = failed.wait().unwrap_err();
    assert!(err.to_string().contains("host unreachable"));
}

#[test]
fn shutdown_rejects_new_work() {
    let scheduler = scheduler();
    scheduler.shutdown();
    assert!(scheduler.schedule_once(|_ctx| Ok(()), Duration::ZERO).is_err());
    assert!(scheduler.run_now(|_ctx| Ok(())).is_err());
}

#[test]
fn queue_with_cap_two_and_four_tasks() {
    let queue = TransferQueue::new(2).unwrap();
    let tasks: Vec<_> = ["t1", "t2", "t3", "t4"].iter().map(|n| gated(n)).collect();
    for (task, _) in &tasks {
        queue.add_task(Arc::clone(task));
    }

    assert_eq!(queue.count_running(), 2);
    assert_eq!(queue.count_waiting(), 2);

    tasks[0].1.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        tasks[0].0.status() == TransferStatus::Complete
            && queue.count_running() == 2
            && queue.count_waiting() == 1
    }));

    for (_, release) in &tasks {
        let _ = release.try_send(());
    }
    assert!(wait_until(Duration::from_secs(5), || queue.is_idle()));
    assert!(tasks.iter().all(|(t, _)| t.status() == TransferStatus::Complete));
}

#[test]
fn running_count_never_exceeds_cap() {
    let cap = 3;
    let queue = TransferQueue::new(cap).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let over_cap = Arc::new(AtomicUsize::new(0));
    {
        let queue_view = queue.clone();
        let over_cap = Arc::clone(&over_cap);
        queue.subscribe(move |_event: &TransferEvent| {
            if queue_view.count_running() > cap {
                over_cap.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    for i in 0..20 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let task = TransferTask::from_fn(
            format!("/tmp/f{i}"),
            format!("/srv/f{i}"),
            TransferDirection::Download,
            move |ctx| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                ctx.set_total(10);
                thread::sleep(Duration::from_millis(10));
                ctx.advance(10);
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
        );
        queue.add_task(Arc::new(task));
    }

    assert!(wait_until(Duration::from_secs(10), || queue.is_idle()));
    assert!(peak.load(Ordering::SeqCst) <= cap);
    assert_eq!(over_cap.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_and_cancelled_transfers_report_events() {
    let queue = TransferQueue::new(1).unwrap();
    let events = queue.event_channel();

    let failing = Arc::new(TransferTask::from_fn(
        "/tmp/bad",
        "/srv/bad",
        TransferDirection::Upload,
        |_| Err(TransferError::failed("No such file")),
    ));
    let (blocked, _release) = gated("blocked");

    queue.add_task(Arc::clone(&failing));
    queue.add_task(Arc::clone(&blocked));
    assert!(wait_until(Duration::from_secs(5), || blocked.status() == TransferStatus::Running));
    assert!(queue.cancel_task(blocked.id()).unwrap());

    let mut saw_error = false;
    let mut saw_cancel = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_error && saw_cancel) && Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(TransferEvent::Error(snapshot)) => {
                assert_eq!(snapshot.id, failing.id());
                assert_eq!(snapshot.error.as_deref(), Some("No such file"));
                saw_error = true;
            }
            Ok(TransferEvent::Cancelled(snapshot)) => {
                assert_eq!(snapshot.id, blocked.id());
                saw_cancel = true;
            }
            _ => {}
        }
    }
    assert!(saw_error && saw_cancel);

    // Cancellation stays distinct from failure
    assert_eq!(blocked.status(), TransferStatus::Cancelled);
    assert!(blocked.error().is_none());
    assert!(wait_until(Duration::from_secs(5), || queue.count_running() == 0));
    assert_eq!(queue.clear_completed(), 2);
    assert!(queue.is_empty());
}

#[test]
fn relay_delivers_bytes_then_eof() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let mut peer_a = TcpStream::connect(addr).unwrap();
    let (relay_a, _) = listener.accept().unwrap();
    let mut peer_b = TcpStream::connect(addr).unwrap();
    let (relay_b, _) = listener.accept().unwrap();

    let handle = Relay::default().forward(relay_a, relay_b).unwrap();

    peer_a.write_all(&[0x01, 0x02, 0x03]).unwrap();
    drop(peer_a);

    let mut received = Vec::new();
    peer_b.read_to_end(&mut received).unwrap();
    assert_eq!(received, vec![0x01, 0x02, 0x03]);

    drop(peer_b);
    let stats = handle.join();
    assert_eq!(stats.bytes_a_to_b, 3);
}
