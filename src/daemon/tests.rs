//! Daemon Network Tests
//!
//! Several daemons on the simulated network: election, joining, registry
//! copies, failover and traffic that crosses daemons.
//!
//! ## Test Scopes
//! - **Election**: Self-election, joining an existing master, convergence.
//! - **Replication**: Byte-equal registry and segment data after a copy.
//! - **Failover**: The deputy takes over when the master dies.
//! - **Cross-daemon requests**: Forwarded joins, application routing, segment broadcasts.
//! - **Protocol guards**: Generation leaps, stale answers, protocol versions.

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::daemon::NetEvent;
    use crate::daemon::sim::{Sim, host};
    use crate::error::RequestError;
    use crate::membership::Role;
    use crate::wire::codes::PROTOCOL_VERSION;
    use crate::wire::{Command, Datagram, Frame};

    // ============================================================
    // Helpers
    // ============================================================

    fn role(sim: &Sim, ip: Ipv4Addr) -> Role {
        sim.daemon(ip).role()
    }

    fn start_master(sim: &mut Sim, octet: u8, priority: i32) -> Ipv4Addr {
        let ip = sim.start(octet, priority);
        assert!(
            sim.run_until(15_000, |s| role(s, ip) == Role::Master),
            "{} never elected itself",
            ip
        );
        ip
    }

    /// Starts a daemon next to a running network and waits until it has
    /// copied the registry and settled into `expected`.
    fn start_joiner(sim: &mut Sim, octet: u8, priority: i32, expected: Role) -> Ipv4Addr {
        let ip = sim.start(octet, priority);
        let settled = sim.run_until(15_000, |s| {
            role(s, ip) == expected && s.daemon(ip).is_ready()
        });
        assert!(settled, "{} stuck as {} (ready={})", ip, role(sim, ip), sim.daemon(ip).is_ready());
        ip
    }

    fn cmd(command: Command) -> Frame {
        Frame::new(command.code()).with_seq(3)
    }

    fn join(sim: &mut Sim, ip: Ipv4Addr, pid: i32, name: &str) -> (usize, u16) {
        let client = sim.client(ip, pid);
        let answer = sim.request(
            client,
            cmd(Command::NewClient)
                .with_params(vec![pid])
                .with_body(name.to_string()),
        );
        let node = answer.param(0).expect("join answered");
        assert!(node >= 0, "join of {} at {} failed: {}", name, ip, node);
        (client, node as u16)
    }

    fn alloc(sim: &mut Sim, client: usize, name: &str, size: i32) -> (i32, usize, usize) {
        let frame = cmd(Command::AllocMem)
            .with_params(vec![0, 1, size])
            .with_body(format!("{} i:value", name));
        let answer = sim.request(client, frame);
        let [seg, offset, size] = answer.params[..] else {
            panic!("allocation of {} failed: {:?}", name, answer.params);
        };
        (seg, offset as usize, size as usize)
    }

    fn fill(sim: &mut Sim, ip: Ipv4Addr, offset: usize, len: usize, seed: u8) {
        let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
        assert!(sim.daemon_mut(ip).arena_mut().write(offset, &data));
    }

    fn assert_same_registry(sim: &Sim, a: Ipv4Addr, b: Ipv4Addr) {
        let (da, db) = (sim.daemon(a), sim.daemon(b));
        assert!(
            da.store().replicated() == db.store().replicated(),
            "registries of {} and {} differ",
            a,
            b
        );
        for id in crate::registry::SegmentId::all() {
            let seg = da.store().segment(id);
            if !seg.is_used() {
                continue;
            }
            let range = seg.range();
            assert_eq!(
                da.arena().read(range.start, range.len()),
                db.arena().read(range.start, range.len()),
                "segment {} data differs",
                seg.name
            );
        }
    }

    // ============================================================
    // TEST 1: Election
    // ============================================================

    #[test]
    fn test_lone_daemon_elects_itself() {
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);

        let election = sim.daemon(a).election();
        assert_eq!(election.generation, 1);
        assert_eq!(election.candidacies(), 1);
        assert!(election.ready);
        assert!(election.deputy.is_none());
    }

    #[test]
    fn test_joiner_becomes_member_then_deputy() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);

        // ACT
        let b = sim.start(2, 10);
        let member = sim.run_until(5_000, |s| role(s, b) == Role::Member);

        // ASSERT: answered on the first broadcast, no candidacy
        assert!(member);
        assert_eq!(sim.daemon(b).election().candidacies(), 0);

        let deputy = sim.run_until(10_000, |s| role(s, b) == Role::Deputy);
        assert!(deputy);
        assert!(sim.daemon(b).is_ready());
        assert_eq!(sim.daemon(b).election().generation, 2);
        assert_eq!(sim.daemon(a).election().generation, 2);
        assert_eq!(role(&sim, a), Role::Master);
        assert_same_registry(&sim, a, b);
    }

    #[test]
    fn test_simultaneous_start_converges() {
        // ARRANGE
        let mut sim = Sim::new();
        let ips: Vec<Ipv4Addr> = [(1, 10), (2, 40), (3, 20), (4, 30)]
            .into_iter()
            .map(|(octet, priority)| sim.start(octet, priority))
            .collect();

        // ACT
        let settled = sim.run_until(60_000, |s| {
            let views: Vec<_> = s.daemons().map(|d| d.current_view()).collect();
            s.daemons().all(|d| d.is_ready())
                && views.iter().all(|v| {
                    v.as_ref().is_some_and(|v| {
                        v.master == host(2) && v.deputy == Some(host(4))
                    })
                })
        });

        // ASSERT
        assert!(settled, "network never converged");
        let masters = sim.daemons().filter(|d| d.role() == Role::Master).count();
        assert_eq!(masters, 1);
        assert_eq!(role(&sim, ips[1]), Role::Master);
        assert_eq!(role(&sim, ips[3]), Role::Deputy);
        assert_eq!(role(&sim, ips[0]), Role::Member);
        assert_eq!(role(&sim, ips[2]), Role::Member);

        let generation = sim.daemon(ips[1]).election().generation;
        for ip in &ips {
            assert_eq!(sim.daemon(*ip).election().generation, generation);
        }
        assert_eq!(
            sim.daemon(ips[1]).election().candidacies(),
            1,
            "the winner stood once"
        );
    }

    // ============================================================
    // TEST 2: Replication
    // ============================================================

    #[test]
    fn test_joiner_copies_registry_and_segments() {
        // ARRANGE: a master with data, one segment spanning several chunks
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let (writer, _) = join(&mut sim, a, 601, "writer");
        let (_, small, small_len) = alloc(&mut sim, writer, "small", 100);
        let (_, big, big_len) = alloc(&mut sim, writer, "big", 70_000);
        fill(&mut sim, a, small, small_len, 1);
        fill(&mut sim, a, big, big_len, 2);
        let reqs = sim.request(
            writer,
            cmd(Command::NewReq).with_body("RUN_START"),
        );
        assert!(reqs.params[0] > 0);

        // ACT: allocate while the joiner is still copying the registry
        let b = sim.start(2, 10);
        let copying = sim.run_until(5_000, |s| s.daemon(b).sync.is_active());
        assert!(copying);
        let (_, late, late_len) = alloc(&mut sim, writer, "late", 64_000);
        fill(&mut sim, a, late, late_len, 3);
        let done = sim.run_until(10_000, |s| s.daemon(b).is_ready());

        // ASSERT
        assert!(done);
        assert_same_registry(&sim, a, b);
        let store = sim.daemon(b).store();
        assert_eq!(store.segment_count(), 3);
        assert_eq!(store.node_count(), 1);
        assert!(store.find_request("RUN_START").is_some());
    }

    #[test]
    fn test_member_follows_later_changes() {
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);

        let (writer, _) = join(&mut sim, a, 602, "writer");
        alloc(&mut sim, writer, "after", 256);
        sim.run_for(50);

        assert_same_registry(&sim, a, b);
        assert!(sim.daemon(b).store().find_segment("after").is_some());
    }

    // ============================================================
    // TEST 3: Failover
    // ============================================================

    #[test]
    fn test_deputy_takes_over() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let c = start_joiner(&mut sim, 3, 5, Role::Member);
        join(&mut sim, a, 701, "alpha");
        join(&mut sim, c, 703, "gamma");
        sim.run_for(50);
        let before = sim.daemon(b).election().generation;

        // ACT
        sim.crash(a);
        let recovered = sim.run_until(5_000, |s| {
            role(s, b) == Role::Master && role(s, c) == Role::Deputy
        });

        // ASSERT
        assert!(recovered, "b={} c={}", role(&sim, b), role(&sim, c));
        assert!(sim.daemon(b).election().generation > before);
        for ip in [b, c] {
            let store = sim.daemon(ip).store();
            let alpha = store.find_node("alpha").expect("name stays indexed");
            assert!(!store.node(alpha).is_live(), "alpha left with its host");
            let gamma = store.find_node("gamma").expect("gamma registered");
            assert!(store.node(gamma).is_live());
        }
        assert_same_registry(&sim, b, c);

        // the survivors still serve requests
        let (client, _) = join(&mut sim, c, 704, "delta");
        assert!(!sim.client_ref(client).closed);
        assert!(sim.daemon(b).store().find_node("delta").is_some());
    }

    #[test]
    fn test_deputy_alone_takes_over() {
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);

        sim.crash(a);
        let master = sim.run_until(2_000, |s| role(s, b) == Role::Master);

        assert!(master, "the deputy needs nobody to take over");
        assert!(sim.daemon(b).election().deputy.is_none());
    }

    /// A member whose master and deputy died together.
    fn stranded_member(sim: &mut Sim) -> Ipv4Addr {
        let a = start_master(sim, 1, 50);
        let b = start_joiner(sim, 2, 10, Role::Deputy);
        let c = start_joiner(sim, 3, 5, Role::Member);
        sim.crash(a);
        sim.crash(b);
        let searching = sim.run_until(1_000, |s| {
            matches!(role(s, c), Role::Searching { .. })
        });
        assert!(searching, "c stayed {}", role(sim, c));
        c
    }

    #[test]
    fn test_losing_master_and_deputy_restarts_search() {
        // ARRANGE
        let mut sim = Sim::new();

        // ACT
        let c = stranded_member(&mut sim);

        // ASSERT: the long countdown, nothing left of the old view
        assert_eq!(role(&sim, c), Role::Searching { countdown: 8 });
        let election = sim.daemon(c).election();
        assert!(election.master.is_none() && election.deputy.is_none());
        assert!(!sim.daemon(c).is_ready());
        let before = election.generation;

        // with nobody left it eventually elects itself
        assert!(sim.run_until(30_000, |s| role(s, c) == Role::Master));
        assert_eq!(sim.daemon(c).election().generation, before + 1);
    }

    // ============================================================
    // TEST 4: Cross-daemon requests
    // ============================================================

    #[test]
    fn test_join_through_second_daemon() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);

        // ACT
        let (beta, node) = join(&mut sim, b, 801, "beta");
        let rival = sim.client(b, 802);
        let started = sim.now();
        let refused = sim.request(
            rival,
            cmd(Command::NewClient)
                .with_params(vec![802])
                .with_body("beta"),
        );

        // ASSERT
        let at_master = sim.daemon(a).store().find_node("beta").unwrap();
        assert_eq!(at_master.0, node);
        assert_eq!(sim.daemon(a).store().node(at_master).ip, b);
        assert_eq!(refused.params, vec![RequestError::Exists.code(), 802]);
        assert!(sim.now() - started >= 1_000, "refusal is delayed");

        sim.kill_client(beta);
        let released = sim.run_until(1_000, |s| {
            !s.daemon(a).store().node(at_master).is_live()
        });
        assert!(released, "master still holds beta");
    }

    #[test]
    fn test_application_request_crosses_daemons() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let (sender, from) = join(&mut sim, a, 901, "sender");
        let (receiver, to) = join(&mut sim, b, 902, "receiver");
        let registered = sim.request(
            sender,
            cmd(Command::NewReq).with_body("CONFIGURE"),
        );
        let configure = registered.params[0] as u16;

        // ACT
        sim.send(
            sender,
            Frame::new(configure)
                .with_src(from)
                .with_dest(to)
                .with_params(vec![1, 2])
                .with_body("run=17"),
        );
        sim.run_for(50);

        // ASSERT
        let got = sim.recv(receiver).expect("routed through the master");
        assert_eq!(got.code, configure);
        assert_eq!((got.src, got.dest), (from, to));
        assert_eq!(&got.body[..], b"run=17");
    }

    #[test]
    fn test_flushed_segment_reaches_peers() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let (writer, _) = join(&mut sim, a, 1001, "writer");
        let (seg, offset, len) = alloc(&mut sim, writer, "counters", 4_000);
        fill(&mut sim, a, offset, len, 9);

        // ACT
        let answer = sim.request(
            writer,
            cmd(Command::FlushMem).with_params(vec![offset as i32, 0]),
        );
        sim.run_for(20);

        // ASSERT
        assert_eq!(answer.params, vec![seg]);
        assert_eq!(
            sim.daemon(b).arena().read(offset, len),
            sim.daemon(a).arena().read(offset, len)
        );
        assert_eq!(sim.daemon(b).refused.count(a), 0);
    }

    #[test]
    fn test_spoofed_segment_data_is_refused() {
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let (writer, _) = join(&mut sim, a, 1101, "writer");
        let (seg, offset, len) = alloc(&mut sim, writer, "counters", 64);
        sim.run_for(20);
        let before = sim.daemon(b).arena().read(offset, len).unwrap().to_vec();

        let spoof = Datagram::new(Command::UsrCpyMem)
            .with_short(seg as u16, 0)
            .with_params(vec![offset as i32])
            .with_body(vec![0xAB; 16])
            .encode()
            .unwrap();
        let intruder = host(66);
        sim.daemon_mut(b).handle(NetEvent::Datagram {
            from: intruder,
            data: spoof,
        });

        assert_eq!(sim.daemon(b).refused.count(intruder), 1);
        assert_eq!(sim.daemon(b).arena().read(offset, len).unwrap(), &before[..]);
    }

    #[test]
    fn test_segment_broadcast_follows_its_cycle() {
        // ARRANGE: a segment cast every 500 ms, never flushed
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let (writer, _) = join(&mut sim, a, 1201, "writer");
        let answer = sim.request(
            writer,
            cmd(Command::AllocMem)
                .with_params(vec![50, 1, 3_000])
                .with_body("status i:value"),
        );
        let [_, offset, len] = answer.params[..] else {
            panic!("allocation failed: {:?}", answer.params);
        };
        let (offset, len) = (offset as usize, len as usize);
        fill(&mut sim, a, offset, len, 5);

        // ACT + ASSERT: nothing before the cycle elapses
        sim.run_for(300);
        assert_ne!(
            sim.daemon(b).arena().read(offset, len),
            sim.daemon(a).arena().read(offset, len)
        );

        // ACT + ASSERT: the owner's daemon sent it unasked
        sim.run_for(1_000);
        assert_eq!(
            sim.daemon(b).arena().read(offset, len),
            sim.daemon(a).arena().read(offset, len)
        );

        // ACT + ASSERT: and keeps sending later changes
        fill(&mut sim, a, offset, len, 6);
        sim.run_for(600);
        assert_eq!(
            sim.daemon(b).arena().read(offset, len),
            sim.daemon(a).arena().read(offset, len)
        );
        assert_eq!(sim.daemon(a).refused.count(b), 0, "b casts nothing it does not own");
    }

    // ============================================================
    // TEST 5: Protocol guards
    // ============================================================

    fn datagram(sim: &mut Sim, to: Ipv4Addr, from: Ipv4Addr, dgram: Datagram) {
        let data = dgram.encode().unwrap();
        sim.daemon_mut(to).handle(NetEvent::Datagram { from, data });
    }

    #[test]
    #[should_panic(expected = "generation leap")]
    fn test_generation_leap_on_ready_daemon_is_fatal() {
        // ARRANGE
        let mut sim = Sim::new();
        start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let daemon = sim.daemon(b);
        let conn = daemon.election().master.expect("deputy knows its master");
        let mut view = daemon.current_view().expect("deputy has a view");
        view.generation += 2;

        // ACT
        let frame = Frame::new(Command::NewMaster.code()).with_params(view.to_params());
        sim.daemon_mut(b).handle(NetEvent::Frame { conn, frame });
    }

    #[test]
    fn test_next_generation_is_adopted() {
        let mut sim = Sim::new();
        start_master(&mut sim, 1, 50);
        let b = start_joiner(&mut sim, 2, 10, Role::Deputy);
        let daemon = sim.daemon(b);
        let conn = daemon.election().master.unwrap();
        let mut view = daemon.current_view().unwrap();
        view.generation += 1;

        let frame = Frame::new(Command::NewMaster.code()).with_params(view.to_params());
        sim.daemon_mut(b).handle(NetEvent::Frame { conn, frame });

        assert_eq!(sim.daemon(b).election().generation, view.generation);
        assert_eq!(role(&sim, b), Role::Deputy);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        // ARRANGE: a searching daemon that has seen generation g
        let mut sim = Sim::new();
        let c = stranded_member(&mut sim);
        let generation = sim.daemon(c).election().generation;
        let stranger = host(9);
        let view = |generation| crate::membership::View {
            master: stranger,
            deputy: None,
            master_started: 1_000,
            deputy_started: 0,
            net_started: 1_000,
            generation,
        };

        // ACT: an answer from an older network
        let stale = Datagram::new(Command::AckDaemon).with_params(view(generation - 1).to_params());
        datagram(&mut sim, c, stranger, stale);

        // ASSERT
        assert!(sim.daemon(c).election().master.is_none());
        assert!(matches!(role(&sim, c), Role::Searching { .. }));

        // ACT: the same answer at the current generation is taken
        let current = Datagram::new(Command::AckDaemon).with_params(view(generation).to_params());
        datagram(&mut sim, c, stranger, current);

        // ASSERT
        assert!(sim.daemon(c).election().master.is_some());
        assert_eq!(role(&sim, c), Role::Member);
    }

    #[test]
    fn test_newer_protocol_stops_the_daemon() {
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);

        let newer = Datagram::new(Command::NewDaemon).with_params(vec![PROTOCOL_VERSION + 1, 10]);
        datagram(&mut sim, a, host(9), newer);

        assert!(sim.daemon(a).is_stopping());
    }

    #[test]
    fn test_older_protocol_gets_our_version() {
        // ARRANGE
        let mut sim = Sim::new();
        let a = start_master(&mut sim, 1, 50);
        let old = host(9);

        // ACT
        let older = Datagram::new(Command::NewDaemon).with_params(vec![PROTOCOL_VERSION - 1, 10]);
        datagram(&mut sim, a, old, older);
        sim.step();

        // ASSERT: answered with NEWDAEMON, not an ACKDAEMON, and still running
        let answers = sim.datagrams_to(old);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].command, Command::NewDaemon);
        assert_eq!(answers[0].params, vec![PROTOCOL_VERSION, 50]);
        assert!(!sim.daemon(a).is_stopping());
        assert_eq!(role(&sim, a), Role::Master);
    }
}
