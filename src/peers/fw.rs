use crate::controller::{ControllerInner, Error};
use crate::models::{FwRule, Node, Peer, PeerAddr, Policy, PolicyKind, Protocol, TrafficDirection};
use ipnet::IpNet;

fn rule(src: IpNet, dst: IpNet, policy: &Policy) -> FwRule {
    FwRule {
        src_ip: src,
        dst_ip: dst,
        allowed_protocol: policy.proto,
        allowed_ports: policy.ports.clone(),
        allow: true,
    }
}

/// Rule for an extra-allowed-IPs CIDR; carries no protocol constraint.
fn extra_rule(src: IpNet, dst: IpNet) -> FwRule {
    FwRule {
        src_ip: src,
        dst_ip: dst,
        allowed_protocol: Protocol::All,
        allowed_ports: Vec::new(),
        allow: true,
    }
}

impl ControllerInner {
    /// Emits the filter entries an ingress gateway applies between its
    /// clients and the rest of the network. Per-pair rules are omitted
    /// whenever the corresponding default policy is a blanket allow; the
    /// endpoint applies the blanket rule instead.
    pub async fn get_fw_rules_on_ingress_gateway(&self, node: &Node) -> Result<Vec<FwRule>, Error> {
        let mut rules = Vec::new();
        let user_policy = self.get_default_policy(&node.network, PolicyKind::User).await?;
        let device_policy = self
            .get_default_policy(&node.network, PolicyKind::Device)
            .await?;

        let mut network_nodes = self.get_network_nodes(&node.network).await?;
        network_nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut peers: Vec<Peer> = network_nodes.into_iter().map(Peer::Device).collect();
        peers.extend(self.get_static_nodes_by_network(&node.network, true).await?);
        let user_nodes = self.get_static_user_nodes_by_network(&node.network).await?;

        // user clients against every device peer
        for user_node in &user_nodes {
            let Peer::StaticUser(user_client) = user_node else {
                continue;
            };
            for peer in &peers {
                if peer.is_user() {
                    continue;
                }
                let (ok, allowed_policies) = self
                    .is_user_allowed_to_communicate(&user_client.owner_id, peer)
                    .await?;
                if !ok {
                    continue;
                }

                if peer.is_static() {
                    if !user_policy.enabled {
                        if let (Some(src), Some(dst)) = (user_node.addr4_net(), peer.addr4_net()) {
                            for policy in &allowed_policies {
                                rules.push(rule(src, dst, policy));
                                rules.push(rule(dst, src, policy));
                            }
                        }
                        if let (Some(src), Some(dst)) = (user_node.addr6_net(), peer.addr6_net()) {
                            for policy in &allowed_policies {
                                rules.push(rule(src, dst, policy));
                                rules.push(rule(dst, src, policy));
                            }
                        }
                    }
                    if let Some(client) = peer.static_client() {
                        for extra in &client.extra_allowed_ips {
                            let src = match extra {
                                IpNet::V4(_) => user_node.addr4_net(),
                                IpNet::V6(_) => user_node.addr6_net(),
                            };
                            if let Some(src) = src {
                                rules.push(extra_rule(src, *extra));
                            }
                        }
                    }
                } else if !user_policy.enabled {
                    if let (Some(src), Some(dst)) = (user_node.addr4_net(), peer.addr4_net()) {
                        for policy in &allowed_policies {
                            rules.push(rule(src, dst, policy));
                        }
                    }
                    if let (Some(src), Some(dst)) = (user_node.addr6_net(), peer.addr6_net()) {
                        for policy in &allowed_policies {
                            rules.push(rule(src, dst, policy));
                        }
                    }
                }
            }
        }

        // device clients against every device peer; a blanket device
        // default replaces all per-pair rules
        if device_policy.enabled {
            return Ok(rules);
        }
        for node_i in &peers {
            let Some(client_i) = node_i.static_client() else {
                continue;
            };
            if node_i.is_user() {
                continue;
            }
            for peer in &peers {
                if peer.is_user() {
                    continue;
                }
                if peer
                    .static_client()
                    .is_some_and(|c| c.client_id == client_i.client_id)
                {
                    continue;
                }
                let (ok, allowed_policies) = self
                    .is_node_allowed_to_communicate(node_i, peer, true)
                    .await?;
                if !ok {
                    continue;
                }

                if let (Some(src), Some(dst)) = (node_i.addr4_net(), peer.addr4_net()) {
                    for policy in &allowed_policies {
                        rules.push(rule(src, dst, policy));
                        if policy.direction == TrafficDirection::Bi {
                            rules.push(rule(dst, src, policy));
                        }
                    }
                }
                if let (Some(src), Some(dst)) = (node_i.addr6_net(), peer.addr6_net()) {
                    for policy in &allowed_policies {
                        rules.push(rule(src, dst, policy));
                        if policy.direction == TrafficDirection::Bi {
                            rules.push(rule(dst, src, policy));
                        }
                    }
                }
                if let Some(client) = peer.static_client() {
                    for extra in &client.extra_allowed_ips {
                        let src = match extra {
                            IpNet::V4(_) => node_i.addr4_net(),
                            IpNet::V6(_) => node_i.addr6_net(),
                        };
                        if let Some(src) = src {
                            rules.push(extra_rule(src, *extra));
                        }
                    }
                }
            }
        }

        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use crate::acls::AclRule;
    use crate::models::{AclId, CustomExtClient, PeerAddr};
    use crate::testutil::{network_with_ingress, test_controller};

    fn enabled_custom(client_id: &str) -> CustomExtClient {
        CustomExtClient {
            client_id: client_id.to_owned(),
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn blanket_device_default_suppresses_pair_rules() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;
        for id in ["c1", "c2"] {
            controller
                .inner
                .create_ext_client(net.clone(), gw.id, String::new(), enabled_custom(id))
                .await
                .unwrap();
        }

        let rules = controller
            .inner
            .get_fw_rules_on_ingress_gateway(&gw)
            .await
            .unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn allowed_static_pair_emits_symmetric_rules() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;

        let mut network = controller.inner.get_network(&net).await.unwrap();
        network.default_device_policy.enabled = false;
        controller.inner.save_network(&network).await.unwrap();

        let c1 = controller
            .inner
            .create_ext_client(net.clone(), gw.id, String::new(), enabled_custom("c1"))
            .await
            .unwrap();
        let c2 = controller
            .inner
            .create_ext_client(net.clone(), gw.id, String::new(), enabled_custom("c2"))
            .await
            .unwrap();

        let mut acls = controller.inner.get_network_acls(&net).await.unwrap();
        acls.change_access(&c1.acl_id(), &c2.acl_id(), AclRule::Allowed);
        controller.inner.save_network_acls(&net, &acls).await.unwrap();

        let rules = controller
            .inner
            .get_fw_rules_on_ingress_gateway(&gw)
            .await
            .unwrap();
        let fwd = rules
            .iter()
            .any(|r| r.src_ip == c1.addr4_net().unwrap() && r.dst_ip == c2.addr4_net().unwrap());
        let rev = rules
            .iter()
            .any(|r| r.src_ip == c2.addr4_net().unwrap() && r.dst_ip == c1.addr4_net().unwrap());
        assert!(fwd && rev);
        assert!(rules.iter().all(|r| r.allow));
    }

    #[tokio::test]
    async fn user_client_rules_target_device_peers_one_way() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;

        let mut network = controller.inner.get_network(&net).await.unwrap();
        network.default_user_policy.enabled = false;
        network.default_device_policy.enabled = true;
        controller.inner.save_network(&network).await.unwrap();

        let mut custom = enabled_custom("u1");
        custom.remote_access_client_id = "rac-1".into();
        let user_client = controller
            .inner
            .create_ext_client(net.clone(), gw.id, "alice".into(), custom)
            .await
            .unwrap();

        let mut acls = controller.inner.get_network_acls(&net).await.unwrap();
        acls.set_rule(&AclId::new("alice"), &gw.acl_id(), AclRule::Allowed);
        controller.inner.save_network_acls(&net, &acls).await.unwrap();

        let rules = controller
            .inner
            .get_fw_rules_on_ingress_gateway(&gw)
            .await
            .unwrap();
        let fwd = rules
            .iter()
            .any(|r| r.src_ip == user_client.addr4_net().unwrap() && r.dst_ip == gw.addr4_net().unwrap());
        let rev = rules
            .iter()
            .any(|r| r.src_ip == gw.addr4_net().unwrap() && r.dst_ip == user_client.addr4_net().unwrap());
        assert!(fwd);
        assert!(!rev);
    }

    #[tokio::test]
    async fn extra_allowed_ips_get_unconstrained_rules() {
        let (controller, _) = test_controller();
        let (net, _host, gw) = network_with_ingress(&controller, "n1").await;

        let mut network = controller.inner.get_network(&net).await.unwrap();
        network.default_device_policy.enabled = false;
        controller.inner.save_network(&network).await.unwrap();

        let c1 = controller
            .inner
            .create_ext_client(net.clone(), gw.id, String::new(), enabled_custom("c1"))
            .await
            .unwrap();
        let mut custom = enabled_custom("c2");
        custom.extra_allowed_ips = vec!["172.16.4.0/24".parse().unwrap()];
        let c2 = controller
            .inner
            .create_ext_client(net.clone(), gw.id, String::new(), custom)
            .await
            .unwrap();

        let mut acls = controller.inner.get_network_acls(&net).await.unwrap();
        acls.change_access(&c1.acl_id(), &c2.acl_id(), AclRule::Allowed);
        controller.inner.save_network_acls(&net, &acls).await.unwrap();

        let rules = controller
            .inner
            .get_fw_rules_on_ingress_gateway(&gw)
            .await
            .unwrap();
        assert!(rules.iter().any(|r| {
            r.src_ip == c1.addr4_net().unwrap()
                && r.dst_ip == "172.16.4.0/24".parse().unwrap()
                && r.allowed_ports.is_empty()
        }));
    }
}
