//! Quorum math.

/// The number of grants needed to win an election: a strict majority.
pub fn elect_quorum(members: usize) -> usize {
    members / 2 + 1
}

/// The number of acknowledgements needed to commit an entry or refresh the
/// leader lease.
///
/// For an even member count of four or more this is `n/2`: together with
/// the leader-completeness rule this still guarantees overlap with every
/// elect quorum, while shaving one acknowledgement off the commit path.
/// For all other sizes it equals the elect quorum.
pub fn rw_quorum(members: usize) -> usize {
    if members >= 4 && members % 2 == 0 {
        members / 2
    } else {
        elect_quorum(members)
    }
}
