/*
 * Created on Mon Jan 13 2025
 *
 * This file is a part of sfsd, a deadlock-free shared-file coordination
 * service implementing the Resource-Allocation-Graph avoidance algorithm.
 *
 * Copyright (c) 2025, the sfsd authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! End-to-end coordination scenarios, participants simulated as threads
//! sharing one heap-backed Region rather than real forked processes --
//! the mutex/condvar protocol underneath is identical either way (see
//! `region::HeapRegion`'s doc comment).

use sfsd::{
    coordinator::Coordinator,
    node::Pid,
    region::HeapRegion,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

fn scratch_file(name: &str) -> String {
    let dir = std::env::temp_dir().join(format!("sfsd-protocol-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"seed").unwrap();
    path.to_str().unwrap().to_owned()
}

fn coordinator(region: &HeapRegion, pid: u64) -> Coordinator {
    Coordinator::from_region(region.handle(), Pid(pid))
}

/// S1: two participants on disjoint resources never block each other. Both
/// acquire concurrently and both succeed without either ever waiting.
#[test]
fn s1_no_conflict() {
    let heap = HeapRegion::new(64 * 1024);
    heap.handle().ensure_initialized().unwrap();
    let a = scratch_file("s1-a.txt");
    let b = scratch_file("s1-b.txt");

    let mut c1 = coordinator(&heap, 1);
    let mut c2 = coordinator(&heap, 2);
    c1.declare(&[&a]).unwrap();
    c2.declare(&[&b]).unwrap();

    let h1 = c1.acquire(&a, "r+").unwrap();
    let h2 = c2.acquire(&b, "r+").unwrap();
    c1.release(h1).unwrap();
    c2.release(h2).unwrap();
    c1.leave().unwrap();
    c2.leave().unwrap();
}

/// S2: avoidance blocks a grant that would close a cycle, and a later
/// release unblocks the waiter. Both participants declare the same two
/// files in opposite orders, so each carries a claim edge on whatever the
/// other ends up holding. With claim edges installed at declare time
/// (rather than only once a participant is already blocked), the cycle
/// shows up as soon as the second participant's *first* acquire would
/// close it through the first participant's outstanding claim -- not only
/// on a later, second request as a claim-free reading of the scenario
/// might suggest.
#[test]
fn s2_avoidance_blocks_then_release_unblocks() {
    let heap = Arc::new(HeapRegion::new(64 * 1024));
    heap.handle().ensure_initialized().unwrap();
    let a = Arc::new(scratch_file("s2-a.txt"));
    let b = Arc::new(scratch_file("s2-b.txt"));

    let mut c1 = coordinator(&heap, 1);
    c1.declare(&[&a, &b]).unwrap();
    let ha = c1.acquire(&a, "r+").unwrap();

    let heap2 = Arc::clone(&heap);
    let a2 = Arc::clone(&a);
    let b2 = Arc::clone(&b);
    let p2_done = Arc::new(AtomicBool::new(false));
    let p2_done2 = Arc::clone(&p2_done);
    let p2 = thread::spawn(move || {
        let mut c2 = coordinator(&heap2, 2);
        c2.declare(&[&b2, &a2]).unwrap();
        // p1 holds a and still claims b; p2 claims a. Granting b to p2 here
        // would close the cycle p2->a->p1->b->p2, so this call blocks until
        // p1 releases a.
        let hb = c2.acquire(&b2, "r+").unwrap();
        let ha2 = c2.acquire(&a2, "r+").unwrap();
        p2_done2.store(true, Ordering::SeqCst);
        c2.release(hb).unwrap();
        c2.release(ha2).unwrap();
        c2.leave().unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!p2_done.load(Ordering::SeqCst), "p2 should still be blocked");

    c1.release(ha).unwrap();
    c1.leave().unwrap();
    p2.join().unwrap();
    assert!(p2_done.load(Ordering::SeqCst));
}

/// S3: three participants declare a circular chain of interests --
/// {a,b}, {b,c}, {c,a} -- the canonical case avoidance exists for. Any
/// interleaving that would deadlock must force at least one participant to
/// block until a holder releases; none may simply fail or panic, and all
/// three eventually finish.
#[test]
fn s3_three_participant_circular_declare() {
    let heap = Arc::new(HeapRegion::new(64 * 1024));
    heap.handle().ensure_initialized().unwrap();
    let a = Arc::new(scratch_file("s3-a.txt"));
    let b = Arc::new(scratch_file("s3-b.txt"));
    let c = Arc::new(scratch_file("s3-c.txt"));

    let finished = Arc::new(AtomicBool::new(false));
    let plans: [(u64, Arc<String>, Arc<String>); 3] = [
        (1, Arc::clone(&a), Arc::clone(&b)),
        (2, Arc::clone(&b), Arc::clone(&c)),
        (3, Arc::clone(&c), Arc::clone(&a)),
    ];

    let workers: Vec<_> = plans
        .into_iter()
        .map(|(pid, first, second)| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let mut p = coordinator(&heap, pid);
                p.declare(&[&first, &second]).unwrap();
                let h1 = p.acquire(&first, "r+").unwrap();
                // give the others a chance to interleave before taking the
                // second resource, so the ring actually has a chance to form
                thread::sleep(Duration::from_millis(10));
                let h2 = p.acquire(&second, "r+").unwrap();
                p.release(h2).unwrap();
                p.release(h1).unwrap();
                p.leave().unwrap();
            })
        })
        .collect();

    for w in workers {
        w.join().expect("participant thread panicked (deadlock or error)");
    }
    finished.store(true, Ordering::SeqCst);
    assert!(finished.load(Ordering::SeqCst));
}

/// S4: a participant that only declares and never acquires still cleans up
/// correctly on `leave` -- its claim is dropped and, since nobody else
/// claims or holds the resource either, the Resource node itself is
/// reclaimed rather than left dangling.
#[test]
fn s4_declare_only_cleanup() {
    let heap = HeapRegion::new(64 * 1024);
    heap.handle().ensure_initialized().unwrap();
    let x = scratch_file("s4-x.txt");

    let mut c1 = coordinator(&heap, 1);
    c1.declare(&[&x]).unwrap();
    c1.leave().unwrap();

    // a fresh participant declaring and acquiring the same path afterwards
    // must succeed exactly as if the resource had never existed.
    let mut c2 = coordinator(&heap, 2);
    c2.declare(&[&x]).unwrap();
    let h = c2.acquire(&x, "r+").unwrap();
    c2.release(h).unwrap();
    c2.leave().unwrap();
}

/// S5: crash safety. A participant declares and acquires a file, then
/// simulates a crash by being dropped without ever calling `release` or
/// `leave` -- the handle it held stays marked open in the graph. `destroy`
/// must still force-close it (rather than hang or refuse) and tear down the
/// region underneath it.
#[test]
fn s5_crash_safety_via_destroy() {
    use sfsd::{config::Config, region};

    let key = 0x5f53_4653u32 as i32 ^ 0x5e5; // distinct key per test process
    let cfg = Config {
        shm_key: key,
        ..Config::default()
    };

    let y = scratch_file("s5-y.txt");
    {
        let mut crashed = Coordinator::init(&cfg).unwrap();
        crashed.declare(&[&y]).unwrap();
        let _h = crashed.acquire(&y, "r+").unwrap();
        // no release, no leave -- `crashed` is simply dropped here, as if
        // the owning process had crashed while still holding the file.
    }

    let mut owner = Coordinator::init(&cfg).unwrap();
    owner.destroy().unwrap();
    let _ = region::unlink(key);
}

/// S6: arena exhaustion. Each declared resource costs two arena slots (its
/// Resource node plus the ListCell backing the claim edge), on top of the
/// one Process node a participant costs the first time it declares
/// anything. A region sized to hold exactly that many nodes can declare
/// exactly one resource; the next `declare` call must fail cleanly through
/// the public API -- not panic, not corrupt the region -- and the region's
/// lock must still be usable afterwards.
#[test]
fn s6_arena_exhaustion_via_declare() {
    use sfsd::error::Error;

    // 1 Process node + 1 Resource node + 1 ListCell claim edge = 3 nodes.
    let region_bytes = sfsd::region::MIN_REGION_BYTES + 2 * sfsd::node::NODE_SIZE;
    let heap = HeapRegion::new(region_bytes);
    heap.handle().ensure_initialized().unwrap();
    assert_eq!(heap.handle().capacity(), 3, "region should hold exactly 3 nodes");

    let mut c = coordinator(&heap, 1);
    c.declare(&["/tmp/s6-0"]).unwrap();

    let err = c.declare(&["/tmp/s6-overflow"]).unwrap_err();
    assert!(matches!(err, Error::OutOfArena));

    // the region must still be usable: a participant dropping out still works.
    c.leave().unwrap();
}

/// Not one of the named scenarios above, but worth keeping: plain
/// sequential contention on a single resource, where no cycle can ever
/// form (a single resource can't participate in one by itself), so this
/// exercises ordinary blocking rather than avoidance.
#[test]
fn sequential_contention_on_one_resource() {
    let heap = Arc::new(HeapRegion::new(64 * 1024));
    heap.handle().ensure_initialized().unwrap();
    let path = Arc::new(scratch_file("seq.txt"));

    let mut c1 = coordinator(&heap, 1);
    c1.declare(&[&path]).unwrap();
    let h1 = c1.acquire(&path, "r+").unwrap();

    let got_it = Arc::new(AtomicBool::new(false));
    let heap2 = Arc::clone(&heap);
    let path2 = Arc::clone(&path);
    let got_it2 = Arc::clone(&got_it);
    let waiter = thread::spawn(move || {
        let mut c2 = coordinator(&heap2, 2);
        c2.declare(&[&path2]).unwrap();
        let h2 = c2.acquire(&path2, "r+").unwrap();
        got_it2.store(true, Ordering::SeqCst);
        c2.release(h2).unwrap();
        c2.leave().unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(
        !got_it.load(Ordering::SeqCst),
        "second participant should still be blocked"
    );

    c1.release(h1).unwrap();
    c1.leave().unwrap();
    waiter.join().unwrap();
    assert!(got_it.load(Ordering::SeqCst));
}
