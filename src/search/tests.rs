use super::*;
use std::net::Ipv4Addr;

fn target() -> NodeId {
    NodeId::ZERO
}

fn id(first: u8, second: u8) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    bytes[1] = second;
    NodeId(bytes)
}

fn addr(first: u8, second: u8) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 2, first, second), 6881)
}

fn search() -> Search {
    Search::new(SearchId(1), target(), None, None, 0)
}

fn publish_search() -> Search {
    Search::new(SearchId(1), target(), Some(6881), None, 0)
}

#[test]
fn candidates_stay_sorted_by_closeness() {
    let mut s = search();
    s.add_candidate(id(0x30, 0), addr(0x30, 0));
    s.add_candidate(id(0x10, 0), addr(0x10, 0));
    s.add_candidate(id(0x20, 0), addr(0x20, 0));
    assert_eq!(
        s.candidate_ids(),
        vec![id(0x10, 0), id(0x20, 0), id(0x30, 0)]
    );
}

#[test]
fn duplicate_id_or_endpoint_is_ignored() {
    let mut s = search();
    s.add_candidate(id(0x10, 0), addr(0x10, 0));
    s.add_candidate(id(0x10, 0), addr(0x99, 0));
    s.add_candidate(id(0x99, 0), addr(0x10, 0));
    assert_eq!(s.len(), 1);
}

#[test]
fn list_is_capped_and_keeps_closest() {
    let mut s = search();
    for i in 0..MAX_CANDIDATES as u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    assert_eq!(s.len(), MAX_CANDIDATES);

    // A closer node displaces the tail.
    s.add_candidate(id(0x01, 0), addr(0x01, 0));
    assert_eq!(s.len(), MAX_CANDIDATES);
    assert_eq!(s.candidate_ids()[0], id(0x01, 0));
    assert!(!s.candidate_ids().contains(&id(0x40, MAX_CANDIDATES as u8 - 1)));

    // A node ranking past a full tail is not admitted.
    s.add_candidate(id(0xF0, 0), addr(0xF0, 0));
    assert!(!s.candidate_ids().contains(&id(0xF0, 0)));
}

#[test]
fn trim_retains_pending_entries_beyond_the_cap() {
    let mut s = search();
    for i in 0..MAX_CANDIDATES as u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    let mut pending = Vec::new();
    while let Some((id, _)) = s.next_contact() {
        pending.push(id);
    }

    // Closer candidates push the in-flight ones past the cap; they must
    // survive trimming, bounding the overshoot by the concurrency width.
    for i in 0..MAX_CANDIDATES as u8 {
        s.add_candidate(id(0x10, i), addr(0x10, i));
    }
    assert_eq!(s.len(), MAX_CANDIDATES + CONCURRENCY);
    for id in &pending {
        assert!(s.candidate_ids().contains(id));
    }
}

#[test]
fn concurrency_cap_limits_pending_contacts() {
    let mut s = search();
    for i in 0..8u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    let mut issued = Vec::new();
    while let Some(contact) = s.next_contact() {
        issued.push(contact);
    }
    assert_eq!(issued.len(), CONCURRENCY);

    // A reply frees exactly one unit.
    s.node_replied(&issued[0].0);
    assert!(s.next_contact().is_some());
    assert!(s.next_contact().is_none());
}

#[test]
fn stall_frees_a_concurrency_unit() {
    let mut s = search();
    for i in 0..8u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    let first = s.next_contact().unwrap();
    while s.next_contact().is_some() {}
    s.node_stalled(&first.0);
    assert!(s.next_contact().is_some());

    // The late reply must not free another unit.
    s.node_replied(&first.0);
    assert!(s.next_contact().is_none());
}

#[test]
fn fixed_point_is_exhausted_list_with_nothing_pending() {
    let mut s = search();
    for i in 0..2u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    assert!(!s.is_complete());
    let a = s.next_contact().unwrap();
    let b = s.next_contact().unwrap();
    assert!(!s.is_complete());
    s.node_replied(&a.0);
    s.node_failed(&b.0);
    assert!(s.is_complete());
}

#[test]
fn announce_refuses_mid_lookup() {
    let mut s = publish_search();
    for i in 0..4u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    s.next_contact();
    assert!(s.start_announce().is_empty());
    assert_eq!(s.phase, Phase::Searching);
}

#[test]
fn announce_targets_replied_candidates() {
    let mut s = publish_search();
    for i in 0..3u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    let mut contacts = Vec::new();
    while let Some(c) = s.next_contact() {
        contacts.push(c);
    }
    s.node_replied(&contacts[0].0);
    s.node_replied(&contacts[1].0);
    s.node_failed(&contacts[2].0);

    let replicas = s.start_announce();
    assert_eq!(s.phase, Phase::Announcing);
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|(id, _)| *id != contacts[2].0));
}

#[test]
fn final_trim_keeps_replied_within_replication_width() {
    let mut s = publish_search();
    for i in 0..MAX_CANDIDATES as u8 {
        s.add_candidate(id(0x40, i), addr(0x40, i));
    }
    // Mark everything replied by walking the list in contact order.
    loop {
        let Some((id, _)) = s.next_contact() else { break };
        s.node_replied(&id);
    }
    let replicas = s.start_announce();
    assert_eq!(replicas.len(), K);
    assert_eq!(s.len(), K);
}

#[test]
fn empty_search_wants_one_restart() {
    let mut s = search();
    s.add_candidate(id(0x40, 0), addr(0x40, 0));
    let (id, _) = s.next_contact().unwrap();
    s.node_failed(&id);
    assert!(s.wants_restart());
    s.restart();
    assert!(!s.wants_restart());
}
