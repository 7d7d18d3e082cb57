//! Unit tests for peridot-types.

use super::*;
use test_case::test_case;

// ============================================================================
// Lsn
// ============================================================================

#[test]
fn lsn_ordering_and_next() {
    let a = Lsn::new(5);
    assert!(a > Lsn::ZERO);
    assert_eq!(a.next(), Lsn::new(6));
}

#[test_case(10, 2, 8; "simple gap")]
#[test_case(5, 5, 0; "equal")]
#[test_case(2, 10, 0; "saturates at zero")]
fn lsn_gap_from(high: i64, low: i64, expected: u64) {
    assert_eq!(Lsn::new(high).gap_from(Lsn::new(low)), expected);
}

// ============================================================================
// Epoch
// ============================================================================

#[test]
fn epoch_lexicographic_order() {
    let e1 = Epoch::new(1, 5);
    let e2 = Epoch::new(2, 0);
    let e3 = Epoch::new(2, 1);

    assert!(e1 < e2);
    assert!(e2 < e3);
    assert!(Epoch::INVALID < e1);
}

#[test]
fn epoch_next_configuration_keeps_data_loss() {
    let e = Epoch::new(3, 7).next_configuration();
    assert_eq!(e, Epoch::new(3, 8));
}

#[test]
fn epoch_next_data_loss_bumps_both() {
    let e = Epoch::new(3, 7).next_data_loss();
    assert_eq!(e, Epoch::new(4, 8));
}

// ============================================================================
// Generation state
// ============================================================================

#[test]
fn generation_state_is_monotonic() {
    let mut state = GenerationState::new();

    assert!(state.set_receive(GenerationNumber::new(5)));
    assert!(!state.set_receive(GenerationNumber::new(3)));
    assert_eq!(state.receive(), GenerationNumber::new(5));

    assert!(state.set_send(GenerationNumber::new(2)));
    assert!(state.set_proposed(GenerationNumber::new(9)));
    assert!(!state.set_proposed(GenerationNumber::new(9)));
}

// ============================================================================
// Node and replica identities
// ============================================================================

#[test]
fn node_instance_supersedes_only_same_node() {
    let n1v1 = NodeInstance::new(NodeId::new(1), 1);
    let n1v2 = NodeInstance::new(NodeId::new(1), 2);
    let n2v2 = NodeInstance::new(NodeId::new(2), 2);

    assert!(n1v2.supersedes(n1v1));
    assert!(!n1v1.supersedes(n1v2));
    assert!(!n2v2.supersedes(n1v1));
}

#[test]
fn replica_roles_in_configuration() {
    assert!(ReplicaRole::Primary.is_in_configuration());
    assert!(ReplicaRole::Secondary.is_in_configuration());
    assert!(!ReplicaRole::Idle.is_in_configuration());
    assert!(!ReplicaRole::None.is_in_configuration());
}

#[test]
fn replica_lifecycle_up_states() {
    assert!(ReplicaLifecycle::Ready.is_up());
    assert!(ReplicaLifecycle::InBuild.is_up());
    assert!(!ReplicaLifecycle::Down.is_up());
    assert!(!ReplicaLifecycle::Dropped.is_up());
}

#[test]
fn replica_description_display_is_compact() {
    let desc = ReplicaDescription::new(
        NodeInstance::new(NodeId::new(1), 1),
        ReplicaId::new(42),
        InstanceId::new(7),
    )
    .with_role(ReplicaRole::Primary);

    assert_eq!(format!("{desc}"), "U/P 42:7 RD");
}

// ============================================================================
// Activity id
// ============================================================================

#[test]
fn activity_id_derive_is_stable_and_distinct() {
    let parent = ActivityId::generate();
    assert_eq!(parent.derive(0), parent.derive(0));
    assert_ne!(parent.derive(0), parent.derive(1));
    assert_ne!(parent.derive(0), parent);
}

// ============================================================================
// Timestamp
// ============================================================================

#[test]
fn timestamp_monotonic_never_regresses() {
    let t1 = Timestamp::now();
    let t2 = Timestamp::now_monotonic(Some(t1));
    assert!(t2 > t1 || t2.as_nanos() == t1.as_nanos() + 1);

    let future = Timestamp::from_nanos(u64::MAX - 10);
    let t3 = Timestamp::now_monotonic(Some(future));
    assert_eq!(t3.as_nanos(), future.as_nanos() + 1);
}

#[test]
fn timestamp_duration_since_saturates() {
    let early = Timestamp::from_nanos(100);
    let late = Timestamp::from_nanos(400);
    assert_eq!(late.duration_since(early).as_nanos(), 300);
    assert_eq!(early.duration_since(late).as_nanos(), 0);
}

// ============================================================================
// Serialization round-trips
// ============================================================================

#[test]
fn postcard_roundtrip_core_types() {
    let desc = ReplicaDescription {
        node: NodeInstance::new(NodeId::new(3), 2),
        replica_id: ReplicaId::new(11),
        instance_id: InstanceId::new(4),
        state: ReplicaLifecycle::InBuild,
        previous_role: ReplicaRole::Idle,
        current_role: ReplicaRole::Secondary,
        last_acked_lsn: Some(Lsn::new(99)),
        first_lsn: None,
    };

    let bytes = postcard::to_allocvec(&desc).unwrap();
    let back: ReplicaDescription = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(desc, back);

    let epoch = Epoch::new(2, 9);
    let bytes = postcard::to_allocvec(&epoch).unwrap();
    let back: Epoch = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(epoch, back);
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn epoch_order_matches_tuple_order(
            a_dl in 0i64..100, a_cfg in 0i64..100,
            b_dl in 0i64..100, b_cfg in 0i64..100,
        ) {
            let a = Epoch::new(a_dl, a_cfg);
            let b = Epoch::new(b_dl, b_cfg);
            prop_assert_eq!(a.cmp(&b), (a_dl, a_cfg).cmp(&(b_dl, b_cfg)));
        }

        #[test]
        fn lsn_roundtrip(v in i64::MIN..i64::MAX) {
            let lsn = Lsn::new(v);
            let bytes = postcard::to_allocvec(&lsn).unwrap();
            let back: Lsn = postcard::from_bytes(&bytes).unwrap();
            prop_assert_eq!(lsn, back);
        }
    }
}
