//! nginx site rendering.
//!
//! One upstream block per environment with healthy backends, one server
//! block per domain and scheme, and one listener on each environment's
//! port. Hosts that match no route hit the default servers, which drop the
//! connection (HTTP 444) or refuse the TLS handshake.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;

use berth_core::EnvironmentName;

use crate::routes::{Route, RouteTable};
use crate::tls::TlsStore;

pub const ACME_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Directory the ACME http-01 challenge files are written to.
    pub acme_webroot: PathBuf,
    /// Prefix for upstream block names.
    pub upstream_prefix: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            acme_webroot: PathBuf::from("/var/www/berth-acme"),
            upstream_prefix: "berth".to_string(),
        }
    }
}

/// Render the complete site file for the current routes and material.
pub fn render_site(table: &RouteTable, tls: &TlsStore, options: &RenderOptions) -> String {
    let mut out = String::new();
    out.push_str("# Managed by berth. Manual changes are overwritten on the next reload.\n\n");

    let mut live = BTreeSet::new();
    for env in table.environments() {
        let endpoints = table.upstream_endpoints(env);
        if endpoints.is_empty() {
            continue;
        }
        let _ = writeln!(out, "upstream {}_{} {{", options.upstream_prefix, env);
        for endpoint in endpoints {
            let _ = writeln!(out, "    server {endpoint};");
        }
        out.push_str("}\n\n");
        live.insert(env);
    }
    let location = |out: &mut String, env: EnvironmentName| {
        if live.contains(&env) {
            proxy_location(out, &format!("{}_{}", options.upstream_prefix, env));
        } else {
            unavailable_location(out);
        }
    };

    for env in table.environments() {
        let Some(port) = table.listen_port(env) else {
            continue;
        };
        let _ = write!(
            out,
            "server {{\n\
             \x20   listen {port};\n\
             \x20   listen [::]:{port};\n\
             \x20   server_name _;\n",
        );
        location(&mut out, env);
        out.push_str("}\n\n");
    }

    out.push_str(
        "server {\n\
         \x20   listen 80 default_server;\n\
         \x20   listen [::]:80 default_server;\n\
         \x20   server_name _;\n\
         \x20   return 444;\n\
         }\n\n",
    );

    let routes: Vec<&Route> = table.routes().collect();
    let any_https = routes
        .iter()
        .any(|r| r.ssl && tls.has_material(&r.domain));
    if any_https {
        out.push_str(
            "server {\n\
             \x20   listen 443 ssl default_server;\n\
             \x20   listen [::]:443 ssl default_server;\n\
             \x20   server_name _;\n\
             \x20   ssl_reject_handshake on;\n\
             }\n\n",
        );
    }

    for route in routes {
        match (route.ssl, tls.get(&route.domain)) {
            (true, Some(material)) => {
                http_server(&mut out, &route.domain, options, |out| {
                    out.push_str("    location / {\n        return 301 https://$host$request_uri;\n    }\n");
                });
                let _ = write!(
                    out,
                    "server {{\n\
                     \x20   listen 443 ssl;\n\
                     \x20   listen [::]:443 ssl;\n\
                     \x20   server_name {domain};\n\
                     \x20   ssl_certificate {cert};\n\
                     \x20   ssl_certificate_key {key};\n",
                    domain = route.domain,
                    cert = material.cert_path.display(),
                    key = material.key_path.display(),
                );
                location(&mut out, route.environment);
                out.push_str("}\n\n");
            }
            (true, None) => {
                // No certificate yet: only the challenge is answered.
                http_server(&mut out, &route.domain, options, unavailable_location);
            }
            (false, _) => {
                http_server(&mut out, &route.domain, options, |out| {
                    location(out, route.environment)
                });
            }
        }
    }

    out
}

/// A port-80 server for `domain` that always answers ACME challenges and
/// renders `body` for everything else.
fn http_server(out: &mut String, domain: &str, options: &RenderOptions, body: impl FnOnce(&mut String)) {
    let _ = write!(
        out,
        "server {{\n\
         \x20   listen 80;\n\
         \x20   listen [::]:80;\n\
         \x20   server_name {domain};\n\
         \x20   location {ACME_CHALLENGE_PATH} {{\n\
         \x20       root {webroot};\n\
         \x20   }}\n",
        webroot = options.acme_webroot.display(),
    );
    body(out);
    out.push_str("}\n\n");
}

fn unavailable_location(out: &mut String) {
    out.push_str("    location / {\n        return 503;\n    }\n");
}

fn proxy_location(out: &mut String, upstream: &str) {
    let _ = write!(
        out,
        "    location / {{\n\
         \x20       proxy_pass http://{upstream};\n\
         \x20       proxy_http_version 1.1;\n\
         \x20       proxy_set_header Host $host;\n\
         \x20       proxy_set_header X-Real-IP $remote_addr;\n\
         \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
         \x20       proxy_set_header X-Forwarded-Proto $scheme;\n\
         \x20   }}\n",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::Backend;
    use crate::tls::TlsMaterial;
    use berth_core::{RawConfig, resolve};

    const TOML: &str = r#"
[project]
name = "shop"

[environments.production]
domain = "app.example.com"
additional_domains = ["www.example.com"]
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

    fn table() -> RouteTable {
        let topology = resolve(&RawConfig::from_toml_str(TOML).unwrap()).unwrap();
        let mut table = RouteTable::new();
        table.reconcile(&topology);
        table
    }

    fn material(domain: &str) -> TlsMaterial {
        TlsMaterial {
            domain: domain.to_string(),
            cert_path: PathBuf::from(format!("/etc/letsencrypt/live/{domain}/fullchain.pem")),
            key_path: PathBuf::from(format!("/etc/letsencrypt/live/{domain}/privkey.pem")),
            expires_at: 1,
        }
    }

    /// The server block whose `server_name` is `domain` on `port`.
    fn server_block<'a>(site: &'a str, domain: &str, port: u16) -> &'a str {
        site.split("server {")
            .find(|block| {
                block.contains(&format!("server_name {domain};"))
                    && block.contains(&format!("listen {port}"))
            })
            .unwrap_or_else(|| panic!("no :{port} server for {domain}"))
    }

    #[test]
    fn unknown_hosts_are_rejected() {
        let site = render_site(&table(), &TlsStore::new(), &RenderOptions::default());
        assert!(site.contains("listen 80 default_server;"));
        assert!(site.contains("return 444;"));
        // No HTTPS servers without material.
        assert!(!site.contains("listen 443"));
    }

    #[test]
    fn ssl_domain_with_material_redirects_and_terminates() {
        let tls = TlsStore::new();
        tls.upsert(material("app.example.com"));
        let site = render_site(&table(), &tls, &RenderOptions::default());

        let http = server_block(&site, "app.example.com", 80);
        assert!(http.contains("return 301 https://$host$request_uri;"));
        assert!(http.contains(ACME_CHALLENGE_PATH));

        let https = server_block(&site, "app.example.com", 443);
        assert!(https.contains("ssl_certificate /etc/letsencrypt/live/app.example.com/fullchain.pem;"));
        assert!(https.contains("proxy_pass http://berth_production;"));
        assert!(site.contains("ssl_reject_handshake on;"));
    }

    #[test]
    fn ssl_domain_without_material_serves_only_the_challenge() {
        let tls = TlsStore::new();
        tls.upsert(material("app.example.com"));
        let site = render_site(&table(), &tls, &RenderOptions::default());

        let http = server_block(&site, "www.example.com", 80);
        assert!(http.contains(ACME_CHALLENGE_PATH));
        assert!(http.contains("return 503;"));
        assert!(!http.contains("proxy_pass"));
        assert!(!site.contains("server_name www.example.com;\n    ssl_certificate"));
    }

    #[test]
    fn plain_domain_proxies_over_http() {
        let mut table = table();
        table.set_backends(
            EnvironmentName::Staging,
            vec![Backend {
                instance_id: "staging-web-1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 32002,
                healthy: true,
            }],
        );
        let site = render_site(&table, &TlsStore::new(), &RenderOptions::default());
        let http = server_block(&site, "staging.example.com", 80);
        assert!(http.contains("proxy_pass http://berth_staging;"));
        assert!(site.contains("upstream berth_staging {\n    server 127.0.0.1:32002;\n}"));
    }

    #[test]
    fn environment_without_healthy_backends_answers_503() {
        let site = render_site(&table(), &TlsStore::new(), &RenderOptions::default());
        assert!(!site.contains("upstream "));
        assert!(!site.contains("proxy_pass"));

        let http = server_block(&site, "staging.example.com", 80);
        assert!(http.contains("return 503;"));
        let direct = server_block(&site, "_", 8002);
        assert!(direct.contains("return 503;"));
    }

    #[test]
    fn environment_port_proxies_to_its_upstream() {
        let mut table = table();
        table.set_backends(
            EnvironmentName::Production,
            vec![Backend {
                instance_id: "production-web-1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 32001,
                healthy: true,
            }],
        );
        let site = render_site(&table, &TlsStore::new(), &RenderOptions::default());
        let direct = server_block(&site, "_", 8001);
        assert!(direct.contains("listen [::]:8001;"));
        assert!(direct.contains("proxy_pass http://berth_production;"));
        assert!(server_block(&site, "_", 8002).contains("return 503;"));
    }
}
