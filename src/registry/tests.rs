//! Registry Module Tests
//!
//! ## Test Scopes
//! - **Hash Index**: Collision runs, wrap-around deletion, random insert/delete sequences.
//! - **Nodes**: Registration, duplicate names, reclaiming names of vanished processes.
//! - **Segments**: First-fit placement, revisions, open/close, departure cascade.
//! - **Replication Log**: Touched ranges reproduce the block byte for byte.
//! - **Regions**: Claiming memory-mapped files by owner pid.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use proptest::prelude::*;

    use crate::error::RequestError;
    use crate::registry::hash::{HashMode, HashOutcome, HashTable, home_bucket};
    use crate::registry::layout::*;
    use crate::registry::ops::Allocation;
    use crate::registry::region::{Claim, claim_regions, pid_alive};
    use crate::registry::store::Store;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn store() -> Store {
        Store::in_memory(100, 1)
    }

    fn join(store: &mut Store, name: &str, pid: i32) -> NodeId {
        store
            .register_node(name, pid, HOST, 10, |_| true)
            .unwrap()
    }

    fn alloc(node: NodeId, name: &str, size: u32) -> Allocation {
        Allocation {
            node,
            name: name.to_string(),
            format: "i4".to_string(),
            revision: 1,
            size,
            cycle: 100,
        }
    }

    /// Names whose home bucket is `bucket`.
    fn names_in_bucket(bucket: usize, count: usize) -> Vec<String> {
        (0..)
            .map(|i| format!("n{i}"))
            .filter(|n| home_bucket(n.as_bytes()) == bucket)
            .take(count)
            .collect()
    }

    // ============================================================
    // TEST 1: Hash Index
    // ============================================================

    #[test]
    fn test_home_bucket_is_stable() {
        assert_eq!(home_bucket(b"RUNCONTROL"), home_bucket(b"RUNCONTROL"));
        assert!(home_bucket(b"x") < HASH_SIZE);
        assert_ne!(home_bucket(b"ab"), home_bucket(b"ba"));
    }

    #[test]
    fn test_collision_run_survives_middle_delete() {
        // ARRANGE: five names sharing one home bucket
        let mut store = store();
        let names = names_in_bucket(7, 5);
        let mut codes = HashMap::new();
        for n in &names {
            codes.insert(n.clone(), store.register_request(n).unwrap());
        }

        // ACT
        store.deregister_request(codes[&names[1]]).unwrap();

        // ASSERT: the rest are still found with the same codes
        assert!(store.hash_consistent(HashTable::Requests));
        assert!(store.find_request(&names[1]).is_none());
        for n in names.iter().filter(|n| *n != &names[1]) {
            let id = store.find_request(n).unwrap();
            assert_eq!(store.request(id).code, codes[n]);
        }
        assert_eq!(store.hash_occupancy(HashTable::Requests), 4);
    }

    #[test]
    fn test_delete_wrapping_past_table_end() {
        // ARRANGE: three names homed in the last bucket spill into 0 and 1,
        // a name homed at 0 lands in 2
        let mut store = store();
        let tail = names_in_bucket(HASH_SIZE - 1, 3);
        let head = names_in_bucket(0, 1);
        for n in tail.iter().chain(head.iter()) {
            store.register_request(n).unwrap();
        }
        store.take_touches();

        // ACT
        let outcome = store.hash(HashTable::Requests, &tail[0], HashMode::Delete);

        // ASSERT: two ranges, one slot at the end and three at the start
        match outcome {
            HashOutcome::Deleted { touched } => {
                assert_eq!(touched.len(), 2);
                assert_eq!(touched[0].pos, HashTable::Requests.slot_pos(HASH_SIZE - 1));
                assert_eq!(touched[0].len, HASH_SLOT);
                assert_eq!(touched[1].pos, HashTable::Requests.slot_pos(0));
                assert_eq!(touched[1].len, 3 * HASH_SLOT);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.hash_consistent(HashTable::Requests));
        for n in tail.iter().skip(1).chain(head.iter()) {
            assert!(store.find_request(n).is_some(), "{n} lost");
        }
    }

    #[test]
    fn test_hash_modes() {
        let mut store = store();
        let code = store.register_request("START").unwrap();
        let id = store.find_request("START").unwrap();

        let found = store.hash(HashTable::Requests, "START", HashMode::Lookup);
        assert!(matches!(found, HashOutcome::Found { offset, .. } if offset == id.offset() as i32));

        let dup = store.hash(HashTable::Requests, "START", HashMode::Insert(id.offset() as i32));
        assert!(matches!(dup, HashOutcome::Duplicate { .. }));

        assert_eq!(
            store.hash(HashTable::Requests, "STOP", HashMode::Lookup),
            HashOutcome::Missing
        );
        store.deregister_request(code).unwrap();
        assert_eq!(
            store.hash(HashTable::Requests, "START", HashMode::Delete),
            HashOutcome::Missing
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..40).prop_map(Op::Add),
            (0usize..40).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        // Property: every present key stays reachable and keeps its record
        #[test]
        fn prop_keys_stay_reachable(ops in prop::collection::vec(op_strategy(), 1..120)) {
            // few buckets worth of names so probe runs overlap
            let pool: Vec<String> = names_in_bucket(3, 10)
                .into_iter()
                .chain(names_in_bucket(4, 10))
                .chain(names_in_bucket(5, 10))
                .chain(names_in_bucket(HASH_SIZE - 1, 10))
                .collect();

            let mut store = store();
            let mut model: HashMap<String, u16> = HashMap::new();

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let name = &pool[i];
                        let code = store.register_request(name).unwrap();
                        if let Some(prev) = model.get(name) {
                            prop_assert_eq!(*prev, code);
                        }
                        model.insert(name.clone(), code);
                    }
                    Op::Remove(i) => {
                        let name = &pool[i];
                        if let Some(code) = model.remove(name) {
                            store.deregister_request(code).unwrap();
                        }
                    }
                }

                prop_assert!(store.hash_consistent(HashTable::Requests));
                prop_assert_eq!(store.hash_occupancy(HashTable::Requests), model.len());
                for (name, code) in &model {
                    let id = store.find_request(name);
                    prop_assert!(id.is_some());
                    prop_assert_eq!(store.request(id.unwrap()).code, *code);
                }
            }
        }
    }

    // ============================================================
    // TEST 2: Nodes
    // ============================================================

    #[test]
    fn test_register_node_and_duplicate() {
        let mut store = store();

        let id = join(&mut store, "RC", 42);
        let node = store.node(id);
        assert_eq!(node.name, "RC");
        assert_eq!(node.pid, 42);
        assert_eq!(node.ip, HOST);
        assert_eq!(store.node_count(), 1);

        let again = store.register_node("RC", 43, HOST, 11, |_| true);
        assert_eq!(again, Err(RequestError::Exists));
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut store = store();
        let long = "x".repeat(NAME_LEN);
        for bad in ["", "has space", "dash-name", long.as_str()] {
            assert_eq!(
                store.register_node(bad, 1, HOST, 1, |_| true),
                Err(RequestError::InvalidName)
            );
        }
        assert!(store.register_node(&"x".repeat(NAME_LEN - 1), 1, HOST, 1, |_| true).is_ok());
    }

    #[test]
    fn test_dead_holder_is_reclaimed() {
        // ARRANGE: holder owns a segment
        let mut store = store();
        let id = join(&mut store, "DAQ", 42);
        let seg = store.allocate_segment(&alloc(id, "DAQ_STATUS", 64), 10).unwrap();

        // ACT: same name, holder reported dead
        let again = store.register_node("DAQ", 77, HOST, 20, |n| n.pid != 42).unwrap();

        // ASSERT: same slot, fresh pid, old segment gone
        assert_eq!(again, id);
        assert_eq!(store.node(id).pid, 77);
        assert!(store.find_segment("DAQ_STATUS").is_none());
        assert!(!store.segment(seg.segment).is_used());
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_released_name_keeps_its_id() {
        let mut store = store();
        let a = join(&mut store, "A", 1);
        let b = join(&mut store, "B", 2);
        store.deregister_node(a, 20);
        assert_eq!(store.node_count(), 1);

        let again = join(&mut store, "A", 3);
        assert_eq!(again, a);
        assert_ne!(again, b);
    }

    #[test]
    fn test_full_table_recycles_oldest_released_slot() {
        let mut store = store();
        let ids: Vec<NodeId> = (0..MAX_NODES)
            .map(|i| join(&mut store, &format!("N{i}"), i as i32 + 1))
            .collect();
        assert_eq!(
            store.register_node("LATE", 9999, HOST, 10, |_| true),
            Err(RequestError::NoFreeSlot)
        );

        store.deregister_node(ids[5], 100);
        store.deregister_node(ids[9], 50);

        // oldest release wins and its old name leaves the index
        let late = store.register_node("LATE", 9999, HOST, 200, |_| true).unwrap();
        assert_eq!(late, ids[9]);
        assert!(store.find_node("N9").is_none());
        assert_eq!(store.find_node("N5"), Some(ids[5]));
        assert!(store.hash_consistent(HashTable::Nodes));
    }

    #[test]
    fn test_nodes_on_host() {
        let mut store = store();
        let local = join(&mut store, "LOCAL", 1);
        let remote = store
            .register_node("REMOTE", 2, Ipv4Addr::new(10, 0, 0, 2), 1, |_| true)
            .unwrap();
        assert_eq!(store.nodes_on_host(HOST), vec![local]);
        assert_eq!(store.nodes_on_host(Ipv4Addr::new(10, 0, 0, 2)), vec![remote]);
    }

    // ============================================================
    // TEST 3: Segments
    // ============================================================

    #[test]
    fn test_first_fit_prefers_lowest_gap() {
        // ARRANGE: gaps of 10 at 0 and 50 at 100
        let mut store = store();
        let n = join(&mut store, "OWNER", 1);
        let s0 = store.allocate_segment(&alloc(n, "S0", 10), 1).unwrap();
        let s1 = store.allocate_segment(&alloc(n, "S1", 90), 1).unwrap();
        let s2 = store.allocate_segment(&alloc(n, "S2", 50), 1).unwrap();
        let s3 = store.allocate_segment(&alloc(n, "S3", 10), 1).unwrap();
        assert_eq!((s0.offset, s1.offset, s2.offset, s3.offset), (0, 10, 100, 150));
        store.release_segment(n, s0.segment).unwrap();
        store.release_segment(n, s2.segment).unwrap();

        // ACT
        let small = store.allocate_segment(&alloc(n, "SMALL", 10), 2).unwrap();
        let mid = store.allocate_segment(&alloc(n, "MID", 40), 2).unwrap();
        let big = store.allocate_segment(&alloc(n, "BIG", 60), 2).unwrap();

        // ASSERT
        assert_eq!(small.offset, 0);
        assert_eq!(mid.offset, 100);
        assert_eq!(big.offset, 160);

        let offsets: Vec<usize> = store
            .alloc_chain()
            .into_iter()
            .map(|id| store.segment(id).range().start)
            .collect();
        assert_eq!(offsets, vec![0, 10, 100, 150, 160]);
    }

    #[test]
    fn test_allocation_beyond_arena_fails() {
        let mut store = store();
        let n = join(&mut store, "OWNER", 1);
        store
            .allocate_segment(&alloc(n, "HUGE", ARENA_SIZE as u32 - 8), 1)
            .unwrap();
        assert_eq!(
            store.allocate_segment(&alloc(n, "MORE", 16), 1),
            Err(RequestError::NoFreeSlot)
        );
        assert_eq!(
            store.allocate_segment(&alloc(n, "ZERO", 0), 1),
            Err(RequestError::InvalidParameter)
        );
    }

    #[test]
    fn test_reopen_reports_already_opened() {
        let mut store = store();
        let owner = join(&mut store, "OWNER", 1);
        let reader = join(&mut store, "READER", 2);
        let seg = store.allocate_segment(&alloc(owner, "DATA", 32), 1).unwrap();

        assert_eq!(store.open_segment(reader, "DATA", 1, 5), Ok(seg.segment));
        assert_eq!(
            store.open_segment(reader, "DATA", 1, 6),
            Err(RequestError::AlreadyOpened)
        );
        assert_eq!(store.segment(seg.segment).refcount, 1);
        assert_eq!(store.reference_count(), 1);
    }

    #[test]
    fn test_open_checks_name_and_revision() {
        let mut store = store();
        let owner = join(&mut store, "OWNER", 1);
        store.allocate_segment(&alloc(owner, "DATA", 32), 1).unwrap();

        assert_eq!(store.open_segment(owner, "NOPE", 1, 1), Err(RequestError::NotFound));
        assert_eq!(
            store.open_segment(owner, "DATA", 3, 1),
            Err(RequestError::StaleRevision)
        );
    }

    #[test]
    fn test_departure_cascades() {
        // ARRANGE: owner holds one unread and one read segment
        let mut store = store();
        let owner = join(&mut store, "OWNER", 1);
        let reader = join(&mut store, "READER", 2);
        let unread = store.allocate_segment(&alloc(owner, "UNREAD", 16), 1).unwrap();
        let read = store.allocate_segment(&alloc(owner, "READ", 16), 1).unwrap();
        store.open_segment(reader, "READ", 1, 2).unwrap();

        // ACT
        let departure = store.deregister_node(owner, 30);

        // ASSERT: unread reclaimed, read orphaned
        assert_eq!(departure.reclaimed, vec![unread.segment]);
        assert_eq!(departure.orphaned, vec![read.segment]);
        assert!(store.find_segment("UNREAD").is_none());
        assert_eq!(store.segment(read.segment).owner, None);
        assert_eq!(store.node(owner).owned_first, None);

        // ACT: last reader leaves
        store.close_segment(reader, read.segment).unwrap();

        // ASSERT
        assert!(store.find_segment("READ").is_none());
        assert_eq!(store.segment_count(), 0);
        assert_eq!(store.alloc_first(), None);
        assert!(store.hash_consistent(HashTable::Segments));
    }

    #[test]
    fn test_reader_departure_reclaims_orphan() {
        let mut store = store();
        let owner = join(&mut store, "OWNER", 1);
        let reader = join(&mut store, "READER", 2);
        let seg = store.allocate_segment(&alloc(owner, "DATA", 16), 1).unwrap();
        store.open_segment(reader, "DATA", 1, 2).unwrap();
        store.release_segment(owner, seg.segment).unwrap();
        assert!(store.find_segment("DATA").is_some());

        let departure = store.deregister_node(reader, 3);

        assert_eq!(departure.released_refs, 1);
        assert_eq!(departure.reclaimed, vec![seg.segment]);
        assert!(store.find_segment("DATA").is_none());
    }

    #[test]
    fn test_reallocation_rules() {
        let mut store = store();
        let first = join(&mut store, "FIRST", 1);
        let second = join(&mut store, "SECOND", 2);
        let reader = join(&mut store, "READER", 3);
        let mut req = alloc(first, "SHARED", 32);
        req.revision = 2;
        let seg = store.allocate_segment(&req, 1).unwrap();
        store.open_segment(reader, "SHARED", 2, 1).unwrap();

        // owned name cannot be taken
        let mut other = req.clone();
        other.node = second;
        assert_eq!(store.allocate_segment(&other, 2), Err(RequestError::Exists));

        store.deregister_node(first, 3);

        // lower revision
        other.revision = 1;
        assert_eq!(store.allocate_segment(&other, 4), Err(RequestError::StaleRevision));

        // same revision, other format
        other.revision = 2;
        other.format = "i8".to_string();
        assert_eq!(store.allocate_segment(&other, 4), Err(RequestError::Exists));

        // same revision and format takes over in place
        other.format = "i4".to_string();
        let taken = store.allocate_segment(&other, 5).unwrap();
        assert_eq!(taken.segment, seg.segment);
        assert_eq!(taken.offset, seg.offset);
        assert!(taken.evicted.is_empty());
        assert_eq!(store.segment(seg.segment).owner, Some(second));
        assert_eq!(store.owned_chain(second), vec![seg.segment]);
    }

    #[test]
    fn test_newer_revision_evicts_readers() {
        let mut store = store();
        let first = join(&mut store, "FIRST", 1);
        let reader = join(&mut store, "READER", 2);
        let seg = store.allocate_segment(&alloc(first, "SHARED", 32), 1).unwrap();
        store.open_segment(reader, "SHARED", 1, 1).unwrap();
        store.deregister_node(first, 2);

        let mut newer = alloc(first, "SHARED", 64);
        newer.revision = 2;
        let first = join(&mut store, "FIRST", 4);
        newer.node = first;
        let taken = store.allocate_segment(&newer, 5).unwrap();

        assert_eq!(taken.segment, seg.segment);
        assert_eq!(taken.evicted, vec![reader]);
        assert_eq!(store.segment(seg.segment).revision, 2);
        assert_eq!(store.segment(seg.segment).size, 64);
    }

    #[test]
    fn test_failed_resize_keeps_segment_placed() {
        // ARRANGE: X orphaned but still read, FILL takes the rest of the arena
        let mut store = store();
        let owner = join(&mut store, "OWNER", 1);
        let filler = join(&mut store, "FILLER", 2);
        let reader = join(&mut store, "READER", 3);
        let x = store.allocate_segment(&alloc(owner, "X", 100), 1).unwrap();
        let fill = store
            .allocate_segment(&alloc(filler, "FILL", ARENA_SIZE as u32 - 100), 1)
            .unwrap();
        store.open_segment(reader, "X", 1, 2).unwrap();
        store.deregister_node(owner, 3);
        let second = join(&mut store, "SECOND", 4);

        // ACT: growing X has nowhere to go
        let grown = store.allocate_segment(&alloc(second, "X", 200), 5);

        // ASSERT: X is untouched and still blocks its bytes
        assert_eq!(grown, Err(RequestError::NoFreeSlot));
        assert_eq!(store.alloc_chain(), vec![x.segment, fill.segment]);
        let record = store.segment(x.segment);
        assert_eq!((record.range(), record.owner), (0..100, None));

        store.release_segment(filler, fill.segment).unwrap();
        let y = store.allocate_segment(&alloc(second, "Y", 50), 6).unwrap();
        assert_eq!(y.offset, 100, "Y must not land on X");

        // a resize with room moves X past Y
        let moved = store.allocate_segment(&alloc(second, "X", 200), 7).unwrap();
        assert_eq!((moved.segment, moved.offset), (x.segment, 150));
        let offsets: Vec<usize> = store
            .alloc_chain()
            .into_iter()
            .map(|id| store.segment(id).range().start)
            .collect();
        assert_eq!(offsets, vec![100, 150]);
    }

    // ============================================================
    // TEST 4: Request names
    // ============================================================

    #[test]
    fn test_request_codes() {
        let mut store = store();
        let start = store.register_request("START").unwrap();
        let stop = store.register_request("STOP").unwrap();
        assert_eq!(start, REQUEST_CODE_BASE);
        assert_eq!(stop, REQUEST_CODE_BASE + 1);
        assert_eq!(store.register_request("START"), Ok(start));
        assert_eq!(store.request_count(), 2);

        store.deregister_request(start).unwrap();
        assert_eq!(store.request_by_code(start), None);
        assert_eq!(store.deregister_request(start), Err(RequestError::NotFound));
        assert_eq!(store.request_by_code(0x0100), None);
    }

    // ============================================================
    // TEST 5: Replication log
    // ============================================================

    #[test]
    fn test_touches_reproduce_the_block() {
        // ARRANGE
        let mut master = store();
        let mut replica = Store::in_memory(200, 2);
        assert_eq!(master.replicated(), replica.replicated());

        // ACT: a mixed workload, replaying touches after each step
        let a = join(&mut master, "A", 1);
        let b = join(&mut master, "B", 2);
        master.allocate_segment(&alloc(a, "SA", 100), 1).unwrap();
        master.allocate_segment(&alloc(b, "SB", 100), 1).unwrap();
        master.open_segment(b, "SA", 1, 1).unwrap();
        master.register_request("GO").unwrap();
        master.deregister_node(a, 5);

        for touch in master.take_touches() {
            assert!(touch.pos >= REPLICATED_START && touch.end() <= REPLICATED_END);
            replica.apply_bytes(touch.pos, &master.bytes()[touch.pos..touch.end()]);
        }

        // ASSERT
        assert_eq!(master.replicated(), replica.replicated());
        assert!(master.take_touches().is_empty());
        assert_eq!(replica.find_segment("SB"), master.find_segment("SB"));
    }

    #[test]
    #[should_panic(expected = "outside replicated block")]
    fn test_out_of_range_chunk_is_fatal() {
        let mut store = store();
        store.apply_bytes(REPLICATED_END - 2, &[0; 4]);
    }

    // ============================================================
    // TEST 6: Regions
    // ============================================================

    #[test]
    fn test_claim_fresh_then_reclaim() {
        let dir = tempfile::TempDir::new().unwrap();
        let me = std::process::id() as i32;

        let (registry, arena, claim) =
            claim_regions(dir.path(), 4000, REGION_SIZE, ARENA_SIZE, me, 7).unwrap();
        assert_eq!(claim, Claim::Fresh);
        assert_eq!(arena.len(), ARENA_SIZE);
        let store = Store::new(registry);
        assert_eq!(store.get_i32(HDR_OWNER_PID), me);
        assert_eq!(store.alloc_first(), None);
        drop(store);
        drop(arena);

        let (_, _, claim) =
            claim_regions(dir.path(), 4000, REGION_SIZE, ARENA_SIZE, me, 8).unwrap();
        assert_eq!(claim, Claim::Reclaimed { previous_owner: me });
    }

    #[test]
    fn test_claim_refuses_live_foreign_owner() {
        let dir = tempfile::TempDir::new().unwrap();
        let me = std::process::id() as i32;

        claim_regions(dir.path(), 4100, REGION_SIZE, ARENA_SIZE, me, 1).unwrap();
        let result = claim_regions(dir.path(), 4100, REGION_SIZE, ARENA_SIZE, me + 1, 2);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("still owned"));
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(0));
        assert!(!pid_alive(-5));
    }
}
