use std::sync::{Arc, Mutex};

use alloctree::Alloc;

fn alloc_free(h: &Alloc, size: usize) {
    let p = h.alloc(size).unwrap();
    unsafe { h.free(p, size) };
}

#[test]
fn parents_survive_until_the_subtree_drains() {
    let root = Alloc::root("r");
    let c1 = root.child("c1").unwrap();
    let c2 = root.child("c2").unwrap();
    let g = c1.child("g").unwrap();

    // The root node lingers while it has children.
    drop(root);
    alloc_free(&c1, 64);
    drop(c2);

    // c1 lingers while g is attached.
    drop(c1);
    alloc_free(&g, 64);
    assert_eq!(g.full_name(), "r.c1.g");

    // Releasing g cascades g -> c1 -> r and tears the tree down.
    drop(g);
}

#[test]
fn name_collision_leaves_the_first_child_intact() {
    let root = Alloc::root("r");
    let first = root.child("x").unwrap();
    assert!(root.child("x").is_none());

    alloc_free(&first, 16);
    assert_eq!(first.stats().blocks_allocated, 1);

    // The name frees up once the first child is destroyed.
    drop(first);
    assert!(root.child("x").is_some());
}

#[test]
fn children_iterate_in_name_order() {
    let root = Alloc::root("r");
    let kept: Vec<Alloc> = ["aaa", "a", "zyx", "bcd"]
        .iter()
        .map(|name| root.child(name).unwrap())
        .collect();

    // Walk the raw cursor protocol.
    let mut seen = Vec::new();
    let mut cur = root.first_child();
    while let Some(h) = cur {
        seen.push(h.name().to_owned());
        cur = h.next_sibling();
    }
    assert_eq!(seen, ["a", "aaa", "bcd", "zyx"]);

    // Same walk through the iterator.
    let seen: Vec<String> = root.children().map(|c| c.name().to_owned()).collect();
    assert_eq!(seen, ["a", "aaa", "bcd", "zyx"]);
    drop(kept);
}

#[test]
fn abandoning_iteration_releases_the_cursor() {
    let root = Alloc::root("r");
    let kept: Vec<Alloc> = ["a", "b", "c"]
        .iter()
        .map(|name| root.child(name).unwrap())
        .collect();

    let first = root.first_child().unwrap();
    assert_eq!(first.name(), "a");
    drop(first);

    let mut iter = root.children();
    assert_eq!(iter.next().unwrap().name(), "a");
    drop(iter);

    // All three children are still attached and ordered.
    assert_eq!(root.children().count(), 3);
    drop(kept);
}

#[test]
fn lookup_uses_the_sorted_order() {
    let root = Alloc::root("r");
    let kept: Vec<Alloc> = ["alpha", "beta", "delta"]
        .iter()
        .map(|name| root.child(name).unwrap())
        .collect();

    assert_eq!(root.find_child("beta").unwrap().name(), "beta");
    assert!(root.find_child("gamma").is_none());
    assert!(root.find_child("aa").is_none());
    assert!(root.find_child("zz").is_none());
    drop(kept);
}

#[test]
fn full_names_join_with_dots() {
    let root = Alloc::root("server");
    let conn = root.child("conn").unwrap();
    let rx = conn.child("rx").unwrap();

    assert_eq!(root.full_name(), "server");
    assert_eq!(conn.full_name(), "server.conn");
    assert_eq!(rx.full_name(), "server.conn.rx");
    assert_eq!(rx.parent().unwrap().full_name(), "server.conn");
}

#[test]
fn reference_pairs_leave_the_handle_unchanged() {
    let root = Alloc::root("r");
    let child = root.child("c").unwrap();

    for _ in 0..5 {
        let held: Vec<Alloc> = (0..4).map(|_| child.clone()).collect();
        drop(held);
    }

    alloc_free(&child, 8);
    assert_eq!(child.stats().live_blocks(), 0);
    assert_eq!(root.children().count(), 1);
}

#[test]
fn leak_reports_fire_on_destruction() {
    let reports: Arc<Mutex<Vec<(String, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);

    let root = Alloc::root("r");
    root.set_leak_report(move |leak| {
        sink.lock()
            .unwrap()
            .push((leak.name.clone(), leak.blocks_leaked, leak.bytes_leaked));
    });

    let child = root.child("c").unwrap();
    let p = child.alloc(16).unwrap();
    drop(child);
    drop(root);

    assert_eq!(
        *reports.lock().unwrap(),
        vec![("r.c".to_owned(), 1, 16)]
    );

    // The handle graph never frees caller blocks; return this one directly.
    unsafe { libc::free(p.as_ptr().cast()) };
}

#[test]
fn cleared_leak_reports_stay_silent() {
    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);

    let root = Alloc::root("r");
    root.set_leak_report(move |leak| sink.lock().unwrap().push(leak.name.clone()));
    root.clear_leak_report();

    let child = root.child("c").unwrap();
    let p = child.alloc(8).unwrap();
    drop(child);
    drop(root);

    assert!(reports.lock().unwrap().is_empty());
    unsafe { libc::free(p.as_ptr().cast()) };
}

#[test]
fn balanced_handles_report_no_leak() {
    let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);

    let root = Alloc::root("r");
    root.set_leak_report(move |leak| sink.lock().unwrap().push(leak.name.clone()));

    let child = root.child("c").unwrap();
    alloc_free(&child, 64);
    drop(child);
    drop(root);

    assert!(reports.lock().unwrap().is_empty());
}
