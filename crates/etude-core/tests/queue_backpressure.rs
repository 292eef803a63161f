// tests/queue_backpressure.rs
//! A one-slot task queue with a single worker: submissions that find the
//! queue full are held by the loop and retried, never dropped.
mod common;

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use etude_core::db::DbResult;
use etude_core::{Database, DispatchMode, MemoryDatabase, TriggerMode};

/// Inserts park until the gate opens, which pins the only worker.
#[derive(Clone)]
struct GatedDatabase {
    inner: MemoryDatabase,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl GatedDatabase {
    fn open(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl Database for GatedDatabase {
    fn load_users(&mut self) -> DbResult<Vec<(String, String)>> {
        self.inner.load_users()
    }

    fn insert_user(&mut self, name: &str, password: &str) -> DbResult<()> {
        let (lock, cvar) = &*self.gate;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
        drop(open);
        self.inner.insert_user(name, password)
    }
}

#[test]
fn full_queue_holds_tasks_until_a_worker_frees_up() {
    let db = GatedDatabase {
        inner: MemoryDatabase::new(),
        gate: Arc::new((Mutex::new(false), Condvar::new())),
    };
    let handles: Vec<Box<dyn Database>> = (0..2)
        .map(|_| Box::new(db.clone()) as Box<dyn Database>)
        .collect();
    let running = common::start_with_db(
        DispatchMode::LoopDrivesIo,
        TriggerMode::LtLt,
        handles,
        |cfg| {
            cfg.worker_threads = 1;
            cfg.max_requests = 1;
            cfg.timeslot = Duration::from_secs(5);
        },
    );
    let addr = running.addr;

    // 1. One registration blocks the worker; the rest overflow the queue
    let clients: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let res = common::post_form(addr, "/3CGISQL.cgi", &format!("queued{}", i), "pw");
                assert_eq!(res.status, 200);
                assert_eq!(res.body_str(), "<html><body>login</body></html>");
            })
        })
        .collect();

    // 2. The loop must be holding at least one task
    assert!(
        common::wait_until(Duration::from_secs(10), || running.metrics.retries() > 0),
        "queue never filled: {:?}",
        running.metrics.snapshot()
    );
    assert_eq!(running.metrics.requests(), 0);

    // 3. Release the worker; every held task is resubmitted and served
    db.open();
    for c in clients {
        c.join().unwrap();
    }
    assert_eq!(running.metrics.requests(), 4);
}
