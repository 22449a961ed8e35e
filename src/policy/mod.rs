use crate::acls::AclRule;
use crate::controller::{ControllerInner, Error};
use crate::models::{AclId, NetId, Peer, PeerAddr, Policy, PolicyKind};

impl ControllerInner {
    pub async fn get_default_policy(
        &self,
        network: &NetId,
        kind: PolicyKind,
    ) -> Result<Policy, Error> {
        let net = self.get_network(network).await?;
        Ok(match kind {
            PolicyKind::User => net.default_user_policy,
            PolicyKind::Device => net.default_device_policy,
        })
    }

    /// Decides whether two devices may talk, returning the policies that
    /// justify an allow. An explicit `NotAllowed` on a required side
    /// blocks regardless of defaults; participants of different networks
    /// never communicate; a self-pair is allowed with no rules.
    pub async fn is_node_allowed_to_communicate(
        &self,
        a: &Peer,
        b: &Peer,
        bidirectional: bool,
    ) -> Result<(bool, Vec<Policy>), Error> {
        let (a_id, b_id) = (a.acl_id(), b.acl_id());
        if a_id == b_id {
            return Ok((true, Vec::new()));
        }
        if a.network() != b.network() {
            return Ok((false, Vec::new()));
        }

        let acls = self.get_network_acls(a.network()).await?;
        let default_policy = self.get_default_policy(a.network(), PolicyKind::Device).await?;

        let mut sides = vec![acls.rule(&a_id, &b_id)];
        if bidirectional {
            sides.push(acls.rule(&b_id, &a_id));
        }

        if sides.iter().any(|rule| *rule == AclRule::NotAllowed) {
            return Ok((false, Vec::new()));
        }
        let explicitly_allowed = sides.iter().all(|rule| *rule == AclRule::Allowed);
        if explicitly_allowed || default_policy.enabled {
            return Ok((true, vec![default_policy]));
        }
        Ok((false, Vec::new()))
    }

    /// User→device variant, keyed by the owning user id and gated on the
    /// network's user default policy.
    pub async fn is_user_allowed_to_communicate(
        &self,
        user_id: &str,
        peer: &Peer,
    ) -> Result<(bool, Vec<Policy>), Error> {
        if user_id.is_empty() {
            return Ok((false, Vec::new()));
        }
        let user_id = AclId::new(user_id);
        let peer_id = peer.acl_id();

        let acls = self.get_network_acls(peer.network()).await?;
        let default_policy = self.get_default_policy(peer.network(), PolicyKind::User).await?;

        let rule = acls.rule(&user_id, &peer_id);
        if rule == AclRule::NotAllowed {
            return Ok((false, Vec::new()));
        }
        if rule == AclRule::Allowed || default_policy.enabled {
            return Ok((true, vec![default_policy]));
        }
        Ok((false, Vec::new()))
    }

    /// The container-only check used when emitting ext-client peers:
    /// absent entries mean allowed, only an explicit `NotAllowed` blocks.
    pub async fn is_peer_allowed(
        &self,
        a: &Peer,
        b: &Peer,
        bidirectional: bool,
    ) -> Result<bool, Error> {
        let (a_id, b_id) = (a.acl_id(), b.acl_id());
        if a_id == b_id {
            return Ok(true);
        }
        if a.network() != b.network() {
            return Ok(false);
        }

        let acls = self.get_network_acls(a.network()).await?;
        if acls.rule(&a_id, &b_id) == AclRule::NotAllowed {
            return Ok(false);
        }
        if bidirectional && acls.rule(&b_id, &a_id) == AclRule::NotAllowed {
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acls::AclRule;
    use crate::controller::Controller;
    use crate::models::Node;
    use crate::testutil::{test_controller, test_host, test_network};

    async fn two_node_network(device_policy_enabled: bool) -> (Controller, Node, Node) {
        let (controller, _) = test_controller();
        let mut network = test_network("n1", "10.0.0.0/24");
        network.default_device_policy.enabled = device_policy_enabled;
        network.default_user_policy.enabled = device_policy_enabled;
        let net = network.net_id.clone();
        controller.inner.save_network(&network).await.unwrap();

        let mut nodes = Vec::new();
        for name in ["h1", "h2"] {
            let host = test_host(name);
            controller.inner.upsert_host(&host).await.unwrap();
            nodes.push(
                controller
                    .inner
                    .join_host_to_network(&host.id, &net)
                    .await
                    .unwrap(),
            );
        }
        let n2 = nodes.pop().unwrap();
        let n1 = nodes.pop().unwrap();
        (controller, n1, n2)
    }

    #[tokio::test]
    async fn disabled_default_blocks_until_explicit_allow() {
        let (controller, n1, n2) = two_node_network(false).await;
        let (a, b) = (Peer::Device(n1.clone()), Peer::Device(n2.clone()));

        let (allowed, rules) = controller
            .inner
            .is_node_allowed_to_communicate(&a, &b, true)
            .await
            .unwrap();
        assert!(!allowed);
        assert!(rules.is_empty());

        let mut acls = controller.inner.get_network_acls(&n1.network).await.unwrap();
        acls.change_access(&a.acl_id(), &b.acl_id(), AclRule::Allowed);
        controller
            .inner
            .save_network_acls(&n1.network, &acls)
            .await
            .unwrap();

        let (allowed, rules) = controller
            .inner
            .is_node_allowed_to_communicate(&a, &b, true)
            .await
            .unwrap();
        assert!(allowed);
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn bidirectional_check_is_symmetric() {
        let (controller, n1, n2) = two_node_network(true).await;
        let (a, b) = (Peer::Device(n1), Peer::Device(n2));

        let (fwd, _) = controller
            .inner
            .is_node_allowed_to_communicate(&a, &b, true)
            .await
            .unwrap();
        let (rev, _) = controller
            .inner
            .is_node_allowed_to_communicate(&b, &a, true)
            .await
            .unwrap();
        assert_eq!(fwd, rev);
    }

    #[tokio::test]
    async fn explicit_not_allowed_wins_over_enabled_default() {
        let (controller, n1, n2) = two_node_network(true).await;
        let (a, b) = (Peer::Device(n1.clone()), Peer::Device(n2));

        let mut acls = controller.inner.get_network_acls(&n1.network).await.unwrap();
        acls.set_rule(&a.acl_id(), &b.acl_id(), AclRule::NotAllowed);
        controller
            .inner
            .save_network_acls(&n1.network, &acls)
            .await
            .unwrap();

        let (allowed, rules) = controller
            .inner
            .is_node_allowed_to_communicate(&a, &b, true)
            .await
            .unwrap();
        assert!(!allowed);
        assert!(rules.is_empty());

        // the container-only check blocks too
        assert!(!controller.inner.is_peer_allowed(&a, &b, true).await.unwrap());
    }

    #[tokio::test]
    async fn self_pair_is_allowed_with_no_rules() {
        let (controller, n1, _) = two_node_network(false).await;
        let a = Peer::Device(n1);

        let (allowed, rules) = controller
            .inner
            .is_node_allowed_to_communicate(&a, &a, true)
            .await
            .unwrap();
        assert!(allowed);
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn user_predicate_follows_user_default_and_entries() {
        let (controller, n1, _) = two_node_network(false).await;
        let peer = Peer::Device(n1.clone());

        let (allowed, _) = controller
            .inner
            .is_user_allowed_to_communicate("alice", &peer)
            .await
            .unwrap();
        assert!(!allowed);

        let mut acls = controller.inner.get_network_acls(&n1.network).await.unwrap();
        acls.set_rule(&AclId::new("alice"), &peer.acl_id(), AclRule::Allowed);
        controller
            .inner
            .save_network_acls(&n1.network, &acls)
            .await
            .unwrap();

        let (allowed, rules) = controller
            .inner
            .is_user_allowed_to_communicate("alice", &peer)
            .await
            .unwrap();
        assert!(allowed);
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn container_only_check_defaults_to_allowed() {
        let (controller, n1, n2) = two_node_network(false).await;
        let (a, b) = (Peer::Device(n1), Peer::Device(n2));
        // no entries anywhere, device default disabled: the peer-emission
        // check still allows
        assert!(controller.inner.is_peer_allowed(&a, &b, true).await.unwrap());
    }
}
