// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for context.rs

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::crd::{GatewaySpec, Port, Server};
    use kube::runtime::watcher;

    fn gateway(namespace: &str, name: &str, port: u32) -> Gateway {
        let mut gateway = Gateway::new(
            name,
            GatewaySpec {
                servers: vec![Server {
                    port: Some(Port {
                        number: port,
                        protocol: "HTTPS".to_string(),
                        name: format!("https-{port}"),
                        target_port: None,
                    }),
                    hosts: vec!["*.example.com".to_string()],
                    name: None,
                }],
                selector: Default::default(),
            },
        );
        gateway.metadata.namespace = Some(namespace.to_string());
        gateway
    }

    #[test]
    fn test_new_stores_are_empty() {
        let (stores, _writer) = Stores::new();
        assert_eq!(stores.gateway_count(), 0);
        assert!(stores.list_gateways().is_empty());
    }

    #[test]
    fn test_stores_reflect_writer() {
        let (stores, mut writer) = Stores::new();
        writer.apply_watcher_event(&watcher::Event::Apply(gateway("apps", "web", 8443)));
        writer.apply_watcher_event(&watcher::Event::Apply(gateway("ops", "web", 9443)));

        assert_eq!(stores.gateway_count(), 2);
        let ops = stores
            .list_gateways()
            .into_iter()
            .find(|g| g.namespace == "ops")
            .unwrap();
        assert_eq!(ops.servers[0].port_number, 9443);

        let mut keys: Vec<String> = stores.list_gateways().iter().map(|g| g.key()).collect();
        keys.sort();
        assert_eq!(keys, vec!["apps/web", "ops/web"]);
    }

    #[test]
    fn test_stores_forget_deleted_gateways() {
        let (stores, mut writer) = Stores::new();
        let gw = gateway("apps", "web", 8443);
        writer.apply_watcher_event(&watcher::Event::Apply(gw.clone()));
        writer.apply_watcher_event(&watcher::Event::Delete(gw));

        assert_eq!(stores.gateway_count(), 0);
    }
}
