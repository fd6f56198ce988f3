#[cfg(test)]
mod tests {
    use crate::cluster::*;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn server(id: &str, port: u16) -> Node {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        Node::new(NodeId::from(id), NodeRole::Server, addr)
    }

    fn servers(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId(format!("s{}", i))).collect()
    }

    // ===== CLUSTER VIEW =====

    #[test]
    fn test_set_status_bumps_incarnation() {
        let view = ClusterView::from_nodes(vec![server("s0", 7000)]);
        let id = NodeId::from("s0");
        assert!(view.is_normal(&id));

        let incarnation = view.set_status(&id, NodeStatus::Unavailable).unwrap();
        assert_eq!(incarnation, 2);
        assert_eq!(view.status(&id), Some(NodeStatus::Unavailable));
        assert!(view.set_status(&NodeId::from("ghost"), NodeStatus::Normal).is_none());
    }

    #[test]
    fn test_apply_ignores_stale_incarnation() {
        let view = ClusterView::from_nodes(vec![server("s0", 7000)]);
        let id = NodeId::from("s0");

        assert!(view.apply(&id, NodeStatus::Overloaded, 5));
        assert!(!view.apply(&id, NodeStatus::Normal, 5));
        assert!(!view.apply(&id, NodeStatus::Normal, 3));
        assert_eq!(view.status(&id), Some(NodeStatus::Overloaded));
    }

    #[test]
    fn test_expire_marks_silent_servers() {
        let view = ClusterView::from_nodes(vec![server("s0", 7000), server("s1", 7001)]);
        let start = Instant::now();
        view.touch(&NodeId::from("s0"), start + Duration::from_secs(9));
        view.touch(&NodeId::from("s1"), start);

        let expired = view.expire(start + Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, NodeId::from("s1"));
        assert!(view.is_normal(&NodeId::from("s0")));
        assert!(!view.is_normal(&NodeId::from("s1")));

        // Already unavailable servers are not reported twice.
        assert!(view.expire(start + Duration::from_secs(20), Duration::from_secs(50)).is_empty());
    }

    #[test]
    fn test_members_with_role_is_sorted() {
        let view = ClusterView::from_nodes(vec![server("s2", 7002), server("s1", 7001)]);
        let ids: Vec<NodeId> = view
            .members_with_role(NodeRole::Server)
            .into_iter()
            .map(|node| node.id)
            .collect();
        assert_eq!(ids, vec![NodeId::from("s1"), NodeId::from("s2")]);
        assert!(view.members_with_role(NodeRole::Proxy).is_empty());
    }

    // ===== PLACEMENT =====

    #[test]
    fn test_placement_is_deterministic() {
        let list = StripeList::new(servers(4), 8, 3, 1).unwrap();
        let first = list.place("book_100");
        let second = list.place("book_100");
        assert_eq!(first, second);
        assert!(first.list_id < 8);
        assert!(first.chunk_id < 3);
        assert_eq!(first.data_peers.len(), 3);
        assert_eq!(first.parity_peers.len(), 1);
    }

    #[test]
    fn test_lists_are_rotations() {
        let list = StripeList::new(servers(4), 4, 3, 1).unwrap();
        let peers = list.list(1).unwrap();
        assert_eq!(peers.data_peers, vec![NodeId::from("s1"), NodeId::from("s2"), NodeId::from("s3")]);
        assert_eq!(peers.parity_peers, vec![NodeId::from("s0")]);
        assert_eq!(peers.peer(3), Some(&NodeId::from("s0")));
        assert_eq!(peers.peer(4), None);

        assert_eq!(list.position(1, &NodeId::from("s0")), Some(3));
        assert_eq!(list.lists_for(&NodeId::from("s0")), vec![(0, 0), (1, 3), (2, 2), (3, 1)]);
    }

    #[test]
    fn test_too_few_servers_is_rejected() {
        assert!(StripeList::new(servers(3), 4, 3, 1).is_err());
        assert!(StripeList::new(servers(4), 0, 3, 1).is_err());
    }

    #[test]
    fn test_keys_spread_over_lists() {
        let list = StripeList::new(servers(6), 16, 4, 2).unwrap();
        let used: std::collections::HashSet<u32> = (0..200)
            .map(|i| list.place(&format!("key-{}", i)).list_id)
            .collect();
        assert!(used.len() > 8);
    }
}
