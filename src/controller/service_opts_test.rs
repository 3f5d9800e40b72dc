//! Tests for per-port option extraction
//!
//! Covers: defaults, implicit vs explicit health checks, permissive HTTP
//! options, certificate resolution, fail-fast ordering and single extraction.

#[cfg(test)]
mod tests {
    use super::super::service_opts::*;
    use crate::annotations::Annotation;
    use crate::cloud::client::CertificateClient;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::types::{
        Certificate, HealthCheckHttpOpts, HealthCheckOpts, Protocol, ServiceHttpOpts,
    };
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn service(annotations: &[(Annotation, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("svc-a".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.key().to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![port(80, Some(30080))]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn port(port: i32, node_port: Option<i32>) -> ServicePort {
        ServicePort {
            port,
            node_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_defaults_leave_health_check_to_backend() {
        let svc = service(&[]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let add = builder.add_opts().await.unwrap();
        assert_eq!(add.protocol, Protocol::Tcp);
        assert_eq!(add.listen_port, 80);
        assert_eq!(add.destination_port, 30080);
        assert!(!add.proxyprotocol);
        assert_eq!(add.http, None);
        assert_eq!(add.health_check, None);

        let update = builder.update_opts().await.unwrap();
        assert_eq!(update.protocol, Some(Protocol::Tcp));
        assert_eq!(update.destination_port, Some(30080));
        assert_eq!(update.health_check, None);
    }

    #[tokio::test]
    async fn test_health_check_inherits_service_protocol_and_port() {
        let svc = service(&[
            (Annotation::PROTOCOL, "http"),
            (Annotation::HEALTH_CHECK_INTERVAL, "5s"),
        ]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let hc = builder.add_opts().await.unwrap().health_check.unwrap();
        assert_eq!(
            hc,
            HealthCheckOpts {
                protocol: Some(Protocol::Http),
                port: Some(30080),
                interval: Some(Duration::from_secs(5)),
                timeout: None,
                retries: None,
                http: None,
            }
        );
    }

    #[tokio::test]
    async fn test_health_check_http_block() {
        let svc = service(&[
            (Annotation::HEALTH_CHECK_PROTOCOL, "https"),
            (Annotation::HEALTH_CHECK_PORT, "8443"),
            (Annotation::HEALTH_CHECK_HTTP_PATH, "/healthz"),
            (Annotation::HEALTH_CHECK_HTTP_VALIDATE_CERTIFICATE, "true"),
            (Annotation::HEALTH_CHECK_HTTP_STATUS_CODES, "2??,301"),
        ]);
        let p = port(443, Some(30443));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let hc = builder.update_opts().await.unwrap().health_check.unwrap();
        assert_eq!(hc.protocol, Some(Protocol::Https));
        assert_eq!(hc.port, Some(8443));
        assert_eq!(
            hc.http,
            Some(HealthCheckHttpOpts {
                domain: None,
                path: Some("/healthz".to_string()),
                status_codes: Some(vec!["2??".to_string(), "301".to_string()]),
                tls: Some(true),
            })
        );
    }

    #[tokio::test]
    async fn test_http_options_accepted_on_tcp() {
        let svc = service(&[
            (Annotation::HTTP_STICKY_SESSIONS, "true"),
            (Annotation::HTTP_COOKIE_LIFETIME, "5m"),
        ]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let add = builder.add_opts().await.unwrap();
        assert_eq!(add.protocol, Protocol::Tcp);
        assert_eq!(
            add.http,
            Some(ServiceHttpOpts {
                cookie_lifetime: Some(Duration::from_secs(300)),
                sticky_sessions: Some(true),
                ..Default::default()
            })
        );
    }

    #[tokio::test]
    async fn test_certificates_by_id_and_name() {
        let svc = service(&[
            (Annotation::PROTOCOL, "https"),
            (Annotation::HTTP_CERTIFICATES, "17,my-cert"),
        ]);
        let p = port(443, Some(30443));
        let cloud = FakeCloud::new();
        cloud.add_certificate(23, "my-cert");
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let add = builder.add_opts().await.unwrap();
        assert_eq!(add.http.unwrap().certificates, Some(vec![17, 23]));

        // Both shapes come from one extraction
        builder.update_opts().await.unwrap();
        assert_eq!(cloud.count("get_certificate"), 1);
    }

    #[tokio::test]
    async fn test_unknown_certificate_aborts_extraction() {
        let svc = service(&[(Annotation::HTTP_CERTIFICATES, "missing")]);
        let p = port(443, Some(30443));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let err = builder.add_opts().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("service_opts::resolve_certificates"));

        // The failure sticks without another lookup
        assert!(builder.update_opts().await.is_err());
        assert_eq!(cloud.count("get_certificate"), 1);
    }

    /// Certificate backend that never answers
    struct Unresponsive;

    #[async_trait]
    impl CertificateClient for Unresponsive {
        async fn get_by_name(&self, _name: &str) -> Result<Option<Certificate>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_certificate_lookup_times_out() {
        let svc = service(&[(Annotation::HTTP_CERTIFICATES, "my-cert")]);
        let p = port(443, Some(30443));
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &Unresponsive).unwrap();

        let err = builder.add_opts().await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout(_)));
        assert!(err.to_string().starts_with("service_opts::resolve_certificates"));

        // The timeout is cached like any other extraction failure
        let err = builder.update_opts().await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_durations_truncated_to_seconds() {
        let svc = service(&[
            (Annotation::HEALTH_CHECK_INTERVAL, "1500ms"),
            (Annotation::HEALTH_CHECK_TIMEOUT, "2.9s"),
            (Annotation::HTTP_COOKIE_LIFETIME, "90.5s"),
        ]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let update = builder.update_opts().await.unwrap();
        let hc = update.health_check.unwrap();
        assert_eq!(hc.interval, Some(Duration::from_secs(1)));
        assert_eq!(hc.timeout, Some(Duration::from_secs(2)));
        assert_eq!(
            update.http.unwrap().cookie_lifetime,
            Some(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn test_first_malformed_annotation_wins() {
        let svc = service(&[
            (Annotation::USES_PROXYPROTOCOL, "maybe"),
            (Annotation::PROTOCOL, "udp"),
            (Annotation::HEALTH_CHECK_RETRIES, "many"),
        ]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let err = builder.extract().await.unwrap_err();
        assert!(err.to_string().contains(Annotation::USES_PROXYPROTOCOL.key()));
    }

    #[tokio::test]
    async fn test_health_check_errors_after_service_errors() {
        let svc = service(&[
            (Annotation::HTTP_REDIRECT_HTTP, "sometimes"),
            (Annotation::HEALTH_CHECK_PORT, "99999"),
        ]);
        let p = port(80, Some(30080));
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();

        let err = builder.extract().await.unwrap_err();
        assert!(err.to_string().contains(Annotation::HTTP_REDIRECT_HTTP.key()));
    }

    #[tokio::test]
    async fn test_missing_node_port() {
        let svc = service(&[]);
        let p = port(80, None);
        let cloud = FakeCloud::new();
        let mut builder = ServiceOptsBuilder::new(&svc, &p, &cloud).unwrap();
        assert!(builder.add_opts().await.is_err());
    }

    #[test]
    fn test_invalid_listen_port() {
        let svc = service(&[]);
        let p = port(70000, Some(30080));
        let cloud = FakeCloud::new();
        assert!(ServiceOptsBuilder::new(&svc, &p, &cloud).is_err());
    }
}
