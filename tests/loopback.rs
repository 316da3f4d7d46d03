//! End-to-end scenarios between two endpoints over loopback UDP.
//!
//! Each test runs its own pair of endpoints on distinct loopback addresses
//! and a private port, so the tests are independent of each other.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use rroce::ctrl::Connecter;
use rroce::types::Pmtu;
use rroce::{
    Permission, QpAttr, Qp, RecvWr, RemoteMem, Roce, RoceConfig, SendWr, Sge, WcFlags, WcOpcode,
    WcStatus,
};

const PMTU: usize = 256;

fn endpoint(ip: Ipv4Addr, port: u16) -> Roce {
    Roce::new(RoceConfig {
        bind: ip,
        port,
        pmtu: Pmtu::Mtu256,
        recv_timeout: Duration::from_millis(500),
    })
    .unwrap()
}

/// Bring two queue pairs to RTS against each other with both flows at PSN 0.
fn connect(a: &Qp, a_roce: &Roce, b: &Qp, b_roce: &Roce) {
    a.modify_qp(&QpAttr::rtr(b_roce.local_gid(), b.qpn(), 0))
        .unwrap();
    a.modify_qp(&QpAttr::rts(0)).unwrap();
    b.modify_qp(&QpAttr::rtr(a_roce.local_gid(), a.qpn(), 0))
        .unwrap();
    b.modify_qp(&QpAttr::rts(0)).unwrap();
}

#[test]
fn zero_length_send_with_immediate() {
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 1), 16811);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 2), 16811);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let b_mr = b_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
    b_qp.post_recv(RecvWr::new(Sge::new(0, 64, b_mr.lkey()), 11));

    a_qp.post_send(SendWr::send_with_imm(Sge::new(0, 0, 0), 5, 0x1234).signaled())
        .unwrap();
    a_qp.process_one_sr().unwrap();

    b.recv_pkts(1).unwrap();
    let cqe = b_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 11);
    assert_eq!(cqe.status, WcStatus::Success);
    assert_eq!(cqe.opcode, WcOpcode::Recv);
    assert_eq!(cqe.byte_len, 0);
    assert!(cqe.flags.contains(WcFlags::WITH_IMM));
    assert_eq!(cqe.imm(), Some(0x1234));
    assert_eq!(cqe.qpn, b_qp.qpn());
    assert_eq!(cqe.src_qp, a_qp.qpn());

    a.recv_pkts(1).unwrap();
    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 5);
    assert_eq!(cqe.opcode, WcOpcode::Send);
    assert_eq!(cqe.byte_len, 0);
    assert_eq!(cqe.status, WcStatus::Success);
}

#[test]
fn two_packet_write_with_immediate() {
    let dlen = PMTU + 10;
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 3), 16812);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 4), 16812);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let a_mr = a_pd.reg_mr(0, 512, Permission::default() | Permission::ZERO_BASED);
    let pattern: Vec<u8> = (0..dlen).map(|i| i as u8).collect();
    a_mr.write(0, &pattern).unwrap();

    // The target region uses absolute addressing.
    let b_mr = b_pd.reg_mr(0x8000, 512, Permission::default());
    b_qp.post_recv(RecvWr::new(Sge::new(0, 0, 0), 21));

    let remote = RemoteMem::from(&b_mr);
    a_qp.post_send(
        SendWr::write_with_imm(Sge::new(0, dlen, a_mr.lkey()), 7, remote, 0xBEEF).signaled(),
    )
    .unwrap();
    a_qp.process_one_sr().unwrap();

    // WRITE_FIRST + WRITE_LAST_WITH_IMMEDIATE.
    b.recv_pkts(2).unwrap();
    let cqe = b_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 21);
    assert_eq!(cqe.opcode, WcOpcode::RecvRdmaImm);
    assert_eq!(cqe.byte_len, dlen);
    assert!(cqe.flags.contains(WcFlags::WITH_IMM));
    assert_eq!(cqe.imm(), Some(0xBEEF));
    assert_eq!(b_mr.read(0x8000, dlen).unwrap(), pattern);

    a.recv_pkts(1).unwrap();
    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 7);
    assert_eq!(cqe.opcode, WcOpcode::RdmaWrite);
    assert_eq!(cqe.status, WcStatus::Success);
}

#[test]
fn multi_packet_read() {
    let dlen = 3 * PMTU;
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 5), 16813);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 6), 16813);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let b_mr = b_pd.reg_mr(0, 1024, Permission::default() | Permission::ZERO_BASED);
    let pattern: Vec<u8> = (0..dlen).map(|i| (i * 7) as u8).collect();
    b_mr.write(8, &pattern).unwrap();

    let a_mr = a_pd.reg_mr(0, 1024, Permission::default() | Permission::ZERO_BASED);
    let remote = RemoteMem::new(8, dlen, b_mr.rkey());
    a_qp.post_send(SendWr::read(Sge::new(0, dlen, a_mr.lkey()), 33, remote))
        .unwrap();
    a_qp.process_one_sr().unwrap();

    b.recv_pkts(1).unwrap();
    // FIRST + MIDDLE + LAST.
    a.recv_pkts(3).unwrap();

    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 33);
    assert_eq!(cqe.opcode, WcOpcode::RdmaRead);
    assert_eq!(cqe.status, WcStatus::Success);
    assert_eq!(cqe.byte_len, dlen);
    assert_eq!(a_mr.read(0, dlen).unwrap(), pattern);
    assert!(b_qp.poll_cq().is_none());
}

#[test]
fn atomic_compare_swap_and_fetch_add() {
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 7), 16814);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 8), 16814);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let b_mr = b_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
    b_mr.write(8, &5u64.to_ne_bytes()).unwrap();
    let a_mr = a_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
    let remote = RemoteMem::new(8, 8, b_mr.rkey());

    // Hit: the slot holds the compare operand, so the swap lands.
    a_qp.post_send(SendWr::compare_swap(Sge::new(0, 8, a_mr.lkey()), 1, remote, 5, 9))
        .unwrap();
    a_qp.process_one_sr().unwrap();
    b.recv_pkts(1).unwrap();
    a.recv_pkts(1).unwrap();

    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.opcode, WcOpcode::CompSwap);
    assert_eq!(cqe.status, WcStatus::Success);
    assert_eq!(cqe.byte_len, 8);
    assert_eq!(a_mr.read(0, 8).unwrap(), 5u64.to_ne_bytes());
    assert_eq!(b_mr.read(8, 8).unwrap(), 9u64.to_ne_bytes());

    // Miss: the slot moved on, so nothing is written back.
    a_qp.post_send(SendWr::compare_swap(Sge::new(16, 8, a_mr.lkey()), 2, remote, 5, 1))
        .unwrap();
    a_qp.process_one_sr().unwrap();
    b.recv_pkts(1).unwrap();
    a.recv_pkts(1).unwrap();

    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.status, WcStatus::Success);
    assert_eq!(a_mr.read(16, 8).unwrap(), 9u64.to_ne_bytes());
    assert_eq!(b_mr.read(8, 8).unwrap(), 9u64.to_ne_bytes());

    // Fetch-and-add returns the pre-add value.
    a_qp.post_send(SendWr::fetch_add(Sge::new(32, 8, a_mr.lkey()), 3, remote, 1))
        .unwrap();
    a_qp.process_one_sr().unwrap();
    b.recv_pkts(1).unwrap();
    a.recv_pkts(1).unwrap();

    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.opcode, WcOpcode::FetchAdd);
    assert_eq!(a_mr.read(32, 8).unwrap(), 9u64.to_ne_bytes());
    assert_eq!(b_mr.read(8, 8).unwrap(), 10u64.to_ne_bytes());
}

#[test]
fn coalesced_ack_completes_in_posting_order() {
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 9), 16815);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 10), 16815);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let a_mr = a_pd.reg_mr(0, 256, Permission::default() | Permission::ZERO_BASED);
    a_mr.write(0, b"coalesced ack payload bytes.....").unwrap();
    let b_mr = b_pd.reg_mr(0, 256, Permission::default() | Permission::ZERO_BASED);
    b_qp.post_recv(RecvWr::new(Sge::new(128, 64, b_mr.lkey()), 40));
    let remote = RemoteMem::from(&b_mr);

    // Two unsignaled writes followed by a signaled send: the single ACK at
    // the send's PSN acknowledges all three.
    a_qp.post_send(SendWr::write(Sge::new(0, 16, a_mr.lkey()), 1, remote))
        .unwrap();
    a_qp.post_send(SendWr::write(Sge::new(16, 16, a_mr.lkey()), 2, RemoteMem::new(16, 16, b_mr.rkey())))
        .unwrap();
    a_qp.post_send(SendWr::send(Sge::new(0, 8, a_mr.lkey()), 3).signaled())
        .unwrap();
    for _ in 0..3 {
        a_qp.process_one_sr().unwrap();
    }

    b.recv_pkts(3).unwrap();
    assert_eq!(b_qp.poll_cq().unwrap().wr_id, 40);
    a.recv_pkts(1).unwrap();

    for (wr_id, opcode) in [
        (1, WcOpcode::RdmaWrite),
        (2, WcOpcode::RdmaWrite),
        (3, WcOpcode::Send),
    ] {
        let cqe = a_qp.poll_cq().unwrap();
        assert_eq!(cqe.wr_id, wr_id);
        assert_eq!(cqe.opcode, opcode);
        assert_eq!(cqe.status, WcStatus::Success);
    }
    assert!(a_qp.poll_cq().is_none());
    assert_eq!(b_mr.read(0, 16).unwrap(), a_mr.read(0, 16).unwrap());
    assert_eq!(b_mr.read(16, 16).unwrap(), a_mr.read(16, 16).unwrap());
}

#[test]
fn rendezvous_with_connecter() {
    let ctrl_addr = (Ipv4Addr::new(127, 0, 0, 1), 16916);

    let server = thread::spawn(move || {
        let mut roce = endpoint(Ipv4Addr::new(127, 0, 0, 11), 16816);
        let (pd, cq) = (roce.alloc_pd(), roce.create_cq());
        let qp = roce.create_qp(&pd, &cq, Permission::default());
        let mr = pd.reg_mr(0, 256, Permission::default() | Permission::ZERO_BASED);

        let conn = Connecter::listen(ctrl_addr).unwrap();
        conn.connect_qp(&qp).unwrap();
        let _peer_mr = conn.exchange_mr(RemoteMem::from(&mr)).unwrap();
        qp.post_recv(RecvWr::new(Sge::new(0, 64, mr.lkey()), 1));
        conn.sync().unwrap();

        // One send and one write arrive.
        roce.recv_pkts(2).unwrap();
        let cqe = qp.poll_cq().unwrap();
        assert_eq!(cqe.opcode, WcOpcode::Recv);
        assert_eq!(cqe.byte_len, 5);
        assert_eq!(mr.read(0, 5).unwrap(), b"hello");
        assert_eq!(mr.read(128, 5).unwrap(), b"world");
        conn.sync().unwrap();
    });

    let mut roce = endpoint(Ipv4Addr::new(127, 0, 0, 12), 16816);
    let (pd, cq) = (roce.alloc_pd(), roce.create_cq());
    let qp = roce.create_qp(&pd, &cq, Permission::default());
    let mr = pd.reg_mr(0, 256, Permission::default() | Permission::ZERO_BASED);
    mr.write(0, b"hello").unwrap();
    mr.write(64, b"world").unwrap();

    let conn = Connecter::connect(ctrl_addr).unwrap();
    conn.connect_qp(&qp).unwrap();
    let peer_mr = conn.exchange_mr(RemoteMem::from(&mr)).unwrap();
    conn.sync().unwrap();

    qp.post_send(SendWr::send(Sge::new(0, 5, mr.lkey()), 1).signaled())
        .unwrap();
    qp.process_one_sr().unwrap();
    qp.post_send(
        SendWr::write(
            Sge::new(64, 5, mr.lkey()),
            2,
            RemoteMem::new(128, 5, peer_mr.rkey),
        )
        .signaled(),
    )
    .unwrap();
    qp.process_one_sr().unwrap();

    // Two ACKs come back.
    roce.recv_pkts(2).unwrap();
    assert_eq!(qp.poll_cq().unwrap().wr_id, 1);
    assert_eq!(qp.poll_cq().unwrap().wr_id, 2);
    conn.sync().unwrap();

    server.join().unwrap();
}

#[test]
fn read_request_reserves_psn_window() {
    // A zero-length read still occupies one PSN and completes with an
    // empty only-response.
    let mut a = endpoint(Ipv4Addr::new(127, 0, 0, 13), 16817);
    let mut b = endpoint(Ipv4Addr::new(127, 0, 0, 14), 16817);
    let (a_pd, a_cq) = (a.alloc_pd(), a.create_cq());
    let (b_pd, b_cq) = (b.alloc_pd(), b.create_cq());
    let a_qp = a.create_qp(&a_pd, &a_cq, Permission::default());
    let b_qp = b.create_qp(&b_pd, &b_cq, Permission::default());
    connect(&a_qp, &a, &b_qp, &b);

    let b_mr = b_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);
    let a_mr = a_pd.reg_mr(0, 64, Permission::default() | Permission::ZERO_BASED);

    a_qp.post_send(SendWr::read(
        Sge::new(0, 0, a_mr.lkey()),
        9,
        RemoteMem::new(0, 0, b_mr.rkey()),
    ))
    .unwrap();
    a_qp.process_one_sr().unwrap();
    b.recv_pkts(1).unwrap();
    a.recv_pkts(1).unwrap();

    let cqe = a_qp.poll_cq().unwrap();
    assert_eq!(cqe.wr_id, 9);
    assert_eq!(cqe.opcode, WcOpcode::RdmaRead);
    assert_eq!(cqe.byte_len, 0);

    // A follow-up send goes through at the next PSN.
    b_qp.post_recv(RecvWr::new(Sge::new(0, 64, b_mr.lkey()), 10));
    a_mr.write(0, b"after").unwrap();
    a_qp.post_send(SendWr::send(Sge::new(0, 5, a_mr.lkey()), 11).signaled())
        .unwrap();
    a_qp.process_one_sr().unwrap();
    b.recv_pkts(1).unwrap();
    a.recv_pkts(1).unwrap();
    assert_eq!(b_qp.poll_cq().unwrap().byte_len, 5);
    assert_eq!(a_qp.poll_cq().unwrap().wr_id, 11);
}
