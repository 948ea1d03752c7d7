//! Concurrent binary search tree built from transactional variables.
//!
//! Nodes are allocated through the transaction's allocator, so an aborted
//! insert releases its node and the retry allocates a fresh one.

use std::sync::Arc;
use std::thread;

use rand::seq::SliceRandom;

use petek_stm::mv::{atomically, TVar};

struct TreeNode {
    key: u64,
    left: TVar<Link>,
    right: TVar<Link>,
}

#[derive(Clone, Copy)]
struct Link(*mut TreeNode);

unsafe impl Send for Link {}
unsafe impl Sync for Link {}

impl Link {
    const EMPTY: Link = Link(std::ptr::null_mut());
}

fn insert(root: &TVar<Link>, key: u64) {
    atomically(|tx| {
        let mut slot = root;
        loop {
            let link = tx.load(slot)?;
            if link.0.is_null() {
                let node = tx.alloc(TreeNode {
                    key,
                    left: TVar::new(Link::EMPTY),
                    right: TVar::new(Link::EMPTY),
                });
                tx.store(slot, Link(node));
                return Ok(());
            }
            // SAFETY: nodes reachable from the tree were published by
            // committed inserts and are never freed while the tree lives;
            // we are inside the transaction's epoch.
            let node = unsafe { &*link.0 };
            if key < node.key {
                slot = &node.left;
            } else if key > node.key {
                slot = &node.right;
            } else {
                return Ok(());
            }
        }
    });
}

/// In-order traversal inside a single transaction.
fn collect_in_order(root: &TVar<Link>) -> Vec<u64> {
    atomically(|tx| {
        let mut keys = Vec::new();
        let mut stack: Vec<*mut TreeNode> = Vec::new();
        let mut curr = tx.load(root)?.0;
        while !curr.is_null() || !stack.is_empty() {
            while !curr.is_null() {
                stack.push(curr);
                // SAFETY: see `insert`.
                curr = tx.load(unsafe { &(*curr).left })?.0;
            }
            let node = stack.pop().unwrap();
            // SAFETY: see `insert`.
            let node = unsafe { &*node };
            keys.push(node.key);
            curr = tx.load(&node.right)?.0;
        }
        Ok(keys)
    })
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_inserts_yield_a_sorted_complete_tree() {
    let threads: u64 = 8;
    let per_thread: u64 = 500;

    let root = Arc::new(TVar::new(Link::EMPTY));

    let mut handles = vec![];
    for t in 0..threads {
        let root = Arc::clone(&root);
        handles.push(thread::spawn(move || {
            // Distinct key ranges per thread, shuffled so the tree does not
            // degenerate into a single spine of lock conflicts.
            let mut keys: Vec<u64> =
                (t * per_thread..(t + 1) * per_thread).collect();
            keys.shuffle(&mut rand::thread_rng());
            for key in keys {
                insert(&root, key);
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let keys = collect_in_order(&root);
    let expected: Vec<u64> = (0..threads * per_thread).collect();
    assert_eq!(keys.len(), expected.len(), "every key exactly once");
    assert_eq!(keys, expected, "in-order traversal must be sorted and complete");
}

#[test]
fn duplicate_inserts_are_ignored() {
    let root = TVar::new(Link::EMPTY);
    for key in [5, 3, 8, 3, 5, 8, 1] {
        insert(&root, key);
    }
    assert_eq!(collect_in_order(&root), vec![1, 3, 5, 8]);
}
