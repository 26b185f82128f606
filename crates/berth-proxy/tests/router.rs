//! ProxyRouter reload behaviour with in-memory and nginx sinks.

use std::sync::Arc;
use std::time::Duration;

use berth_core::{EnvironmentName, RawConfig, Topology, resolve};
use berth_proxy::*;

const TOML: &str = r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
port = 8001
[environments.production.images]
app = "shop:v1"

[environments.staging]
domain = "staging.example.com"
ssl = false
port = 8002
[environments.staging.images]
app = "shop:v2"
"#;

fn topology() -> Topology {
    resolve(&RawConfig::from_toml_str(TOML).unwrap()).unwrap()
}

fn router_with(sink: Arc<dyn ProxySink>) -> ProxyRouter {
    let router = ProxyRouter::new(sink, Arc::new(TlsStore::new()), RenderOptions::default());
    router.reconcile_routes(&topology());
    router
}

#[tokio::test]
async fn reload_activates_rendered_site() {
    let sink = Arc::new(MemorySink::new());
    let router = router_with(sink.clone());
    router.set_backends(
        EnvironmentName::Production,
        vec![Backend {
            instance_id: "production-web-1".to_string(),
            address: "127.0.0.1".to_string(),
            port: 32001,
            healthy: true,
        }],
    );

    router.reload().await.unwrap();
    let site = sink.active_site().unwrap();
    assert!(site.contains("upstream berth_production {\n    server 127.0.0.1:32001;\n}"));
    assert!(site.contains("server_name staging.example.com;"));
    assert_eq!(router.reloads_performed(), 1);
}

#[tokio::test]
async fn rejected_reload_keeps_previous_site() {
    let sink = Arc::new(MemorySink::new());
    let router = router_with(sink.clone());
    router.reload().await.unwrap();
    let good = sink.active_site().unwrap();

    sink.reject_containing("127.0.0.1:32009");
    router.set_backends(
        EnvironmentName::Staging,
        vec![Backend {
            instance_id: "staging-web-9".to_string(),
            address: "127.0.0.1".to_string(),
            port: 32009,
            healthy: true,
        }],
    );
    let err = router.reload().await.unwrap_err();
    assert!(matches!(err, ProxyError::ReloadRejected(_)));
    assert_eq!(sink.active_site().unwrap(), good);
    assert_eq!(sink.activations().len(), 1);
}

#[tokio::test]
async fn concurrent_reloads_are_coalesced() {
    let sink = Arc::new(MemorySink::new());
    sink.set_delay(Duration::from_millis(100));
    let router = Arc::new(router_with(sink.clone()));

    let first = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.reload().await })
    };
    // Let the first reload get going.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (a, b, c) = futures::join!(router.reload(), router.reload(), router.reload());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    first.await.unwrap().unwrap();

    // One in flight plus one follow-up covering the three queued requests.
    assert_eq!(router.reloads_performed(), 2);
    assert_eq!(sink.activations().len(), 2);
}

#[tokio::test]
async fn sequential_reloads_are_not_coalesced() {
    let sink = Arc::new(MemorySink::new());
    let router = router_with(sink.clone());
    router.reload().await.unwrap();
    router.reload().await.unwrap();
    assert_eq!(router.reloads_performed(), 2);
}

#[tokio::test]
async fn tls_material_switches_domain_to_https() {
    let sink = Arc::new(MemorySink::new());
    let router = router_with(sink.clone());
    for (env, port) in [(EnvironmentName::Production, 32001), (EnvironmentName::Staging, 32002)] {
        router.set_backends(
            env,
            vec![Backend {
                instance_id: format!("{env}-web-1"),
                address: "127.0.0.1".to_string(),
                port,
                healthy: true,
            }],
        );
    }
    router.reload().await.unwrap();
    assert!(sink.active_site().unwrap().contains("return 503;"));

    router.tls().upsert(TlsMaterial {
        domain: "app.example.com".to_string(),
        cert_path: "/certs/app.example.com/fullchain.pem".into(),
        key_path: "/certs/app.example.com/privkey.pem".into(),
        expires_at: 1,
    });
    router.reload().await.unwrap();
    let site = sink.active_site().unwrap();
    assert!(!site.contains("return 503;"));
    assert!(site.contains("listen 443 ssl;"));
}

#[cfg(unix)]
mod nginx {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// A stand-in nginx that rejects any site containing `BROKEN`.
    fn fake_nginx(dir: &Path, site: &Path) -> PathBuf {
        let script = dir.join("nginx");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 if [ \"$1\" = \"-t\" ] && grep -q BROKEN \"{}\"; then\n\
                 \x20 echo 'nginx: [emerg] unknown directive \"BROKEN\"' >&2\n\
                 \x20 exit 1\n\
                 fi\n\
                 exit 0\n",
                site.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn valid_site_is_written_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("berth.conf");
        let sink = NginxSink::new(&site).with_binary(fake_nginx(dir.path(), &site));

        sink.validate("server { listen 80; }\n").await.unwrap();
        sink.activate().await.unwrap();
        assert_eq!(std::fs::read_to_string(&site).unwrap(), "server { listen 80; }\n");
    }

    #[tokio::test]
    async fn rejected_site_restores_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("berth.conf");
        std::fs::write(&site, "# previous\n").unwrap();
        let sink = NginxSink::new(&site).with_binary(fake_nginx(dir.path(), &site));

        let err = sink.validate("BROKEN;\n").await.unwrap_err();
        match err {
            ProxyError::ReloadRejected(reason) => assert!(reason.contains("unknown directive")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&site).unwrap(), "# previous\n");
    }

    #[tokio::test]
    async fn missing_binary_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("berth.conf");
        let sink = NginxSink::new(&site).with_binary(dir.path().join("no-such-nginx"));

        let err = sink.validate("server {}\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::Unreachable(_)));
        // Nothing existed before, so nothing is left behind.
        assert!(!site.exists());
    }
}
