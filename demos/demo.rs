//! Minimal end-to-end demonstration: two threads incrementing counters
//! while a `reader`-style snapshot observes them.

slotstat::stats_module!(DEMO);

fn worker_a(iterations: u64) {
    for _ in 0..iterations {
        *slotstat::counter!(DEMO, "demo.requests") += 1;
        *slotstat::counter!(DEMO, "demo.worker_a") += 1;
    }
}

fn worker_b(iterations: u64) {
    for _ in 0..iterations {
        *slotstat::counter!(DEMO, "demo.requests") += 1;
        *slotstat::counter!(DEMO, "demo.worker_b") += 1;
    }
}

fn main() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("demo.stats");
    slotstat::open(&path).expect("open stats file");

    std::thread::scope(|scope| {
        scope.spawn(|| worker_a(3));
        scope.spawn(|| worker_b(5));
    });

    for dump in slotstat::reader::snapshot(&path).expect("read stats file") {
        for counter in dump.counters {
            println!("[{}] {}: {}", dump.tid, counter.name, counter.value);
        }
    }
}
