//! Nacos open API client.
//!
//! Talks to the v1 HTTP endpoints (`/nacos/v1/auth/login`,
//! `/nacos/v1/ns/service/list`, `/nacos/v1/ns/instance/list`). The access
//! token is fetched lazily and cached until shortly before its TTL runs
//! out. A request rejected with 401/403 triggers one re-login and one retry.
//!
//! Re-login is serialized behind the session mutex. Each login bumps a
//! generation counter; a caller whose rejected token belongs to an older
//! generation picks up the newer token instead of logging in again, so a
//! burst of concurrent rejections costs a single login.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::Registry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{Instance, ServiceName};

const LOGIN_PATH: &str = "nacos/v1/auth/login";
const SERVICE_LIST_PATH: &str = "nacos/v1/ns/service/list";
const INSTANCE_LIST_PATH: &str = "nacos/v1/ns/instance/list";

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 1_000;
/// Nacos' own default when the login response omits `tokenTtl`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(18_000);
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

pub struct NacosRegistry {
    http: reqwest::Client,
    base: Url,
    username: String,
    password: String,
    session: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    current: Option<Session>,
    generation: u64,
}

struct Session {
    token: String,
    expires_at: Instant,
    generation: u64,
}

impl Session {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    fn credential(&self) -> Credential {
        Credential {
            token: Some(self.token.clone()),
            generation: self.generation,
        }
    }
}

/// What a single request authenticates with. Never leaves this module.
#[derive(Clone)]
struct Credential {
    token: Option<String>,
    generation: u64,
}

impl Credential {
    fn anonymous() -> Self {
        Self {
            token: None,
            generation: 0,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: Option<String>,
    token_ttl: Option<u64>,
}

#[derive(Deserialize)]
struct ServiceList {
    count: Option<usize>,
    #[serde(default)]
    doms: Vec<ServiceName>,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<Instance>,
}

impl NacosRegistry {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut base = Url::parse(&config.server)?;
        // Keep any path prefix when joining endpoint paths onto it.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
            session: Mutex::new(SessionState::default()),
        })
    }

    fn auth_enabled(&self) -> bool {
        !self.username.is_empty()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::invalid_response(format!("cannot build URL for {}: {}", path, e)))
    }

    async fn credential(&self) -> Result<Credential> {
        if !self.auth_enabled() {
            return Ok(Credential::anonymous());
        }
        let mut state = self.session.lock().await;
        if let Some(session) = state.current.as_ref().filter(|s| s.is_fresh()) {
            return Ok(session.credential());
        }
        self.login(&mut state).await
    }

    async fn refresh(&self, rejected: &Credential) -> Result<Credential> {
        let mut state = self.session.lock().await;
        if let Some(session) = state.current.as_ref() {
            if session.generation != rejected.generation && session.is_fresh() {
                debug!("Session already refreshed by a concurrent request");
                return Ok(session.credential());
            }
        }
        self.login(&mut state).await
    }

    async fn login(&self, state: &mut SessionState) -> Result<Credential> {
        state.current = None;

        let url = self.endpoint(LOGIN_PATH)?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(Error::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::unreachable(format!("login returned {}: {}", status, body.trim()))
            } else {
                Error::auth_failure(format!("login rejected with {}: {}", status, body.trim()))
            });
        }

        let body: LoginResponse = response.json().await.map_err(Error::from_transport)?;
        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::auth_failure("login response carried no access token"))?;
        let ttl = body
            .token_ttl
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);

        state.generation += 1;
        let session = Session {
            token,
            expires_at: Instant::now() + ttl.saturating_sub(TOKEN_REFRESH_MARGIN),
            generation: state.generation,
        };
        info!(
            "Authenticated with Nacos at {} as {} (token valid for {}s)",
            self.base,
            self.username,
            ttl.as_secs()
        );

        let credential = session.credential();
        state.current = Some(session);
        Ok(credential)
    }

    async fn send_get(
        &self,
        url: &Url,
        params: &[(&str, String)],
        credential: &Credential,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.get(url.clone()).query(params);
        if let Some(token) = &credential.token {
            request = request.query(&[("accessToken", token)]);
        }
        request.send().await.map_err(Error::from_transport)
    }

    /// GET `path` and decode the JSON body. `service` is set for instance
    /// queries so a missing service maps to [`Error::ServiceNotFound`].
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        service: Option<&str>,
    ) -> Result<T> {
        let url = self.endpoint(path)?;
        let credential = self.credential().await?;
        let mut response = self.send_get(&url, params, &credential).await?;

        if is_auth_rejected(response.status()) {
            if !self.auth_enabled() {
                return Err(Error::auth_failure(format!(
                    "{} returned {} and no credentials are configured",
                    path,
                    response.status()
                )));
            }
            warn!(
                "Nacos rejected the session on {} ({}), logging in again",
                path,
                response.status()
            );
            let credential = self.refresh(&credential).await?;
            response = self.send_get(&url, params, &credential).await?;
            if is_auth_rejected(response.status()) {
                return Err(Error::auth_failure(format!(
                    "{} still rejected after re-login ({})",
                    path,
                    response.status()
                )));
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body, service));
        }
        response.json::<T>().await.map_err(Error::from_transport)
    }
}

fn is_auth_rejected(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn classify_failure(status: StatusCode, body: &str, service: Option<&str>) -> Error {
    if let Some(service) = service {
        if status == StatusCode::NOT_FOUND || body.to_ascii_lowercase().contains("not found") {
            return Error::service_not_found(service);
        }
    }
    let detail = format!("registry returned {}: {}", status, body.trim());
    if status.is_server_error() {
        Error::unreachable(detail)
    } else {
        Error::invalid_response(detail)
    }
}

#[async_trait]
impl Registry for NacosRegistry {
    async fn list_services(&self, namespace: &str, group: &str) -> Result<BTreeSet<ServiceName>> {
        let mut names = BTreeSet::new();
        let mut page_no: usize = 1;
        loop {
            let params = [
                ("namespaceId", namespace.to_string()),
                ("groupName", group.to_string()),
                ("pageNo", page_no.to_string()),
                ("pageSize", PAGE_SIZE.to_string()),
            ];
            let page: ServiceList = self.get_json(SERVICE_LIST_PATH, &params, None).await?;
            let received = page.doms.len();
            let before = names.len();
            names.extend(page.doms);

            if received < PAGE_SIZE || page.count.is_some_and(|count| names.len() >= count) {
                break;
            }
            // Pages that repeat or overlap would otherwise never reach `count`.
            let last_page = page
                .count
                .map_or(MAX_PAGES, |count| count.div_ceil(PAGE_SIZE) + 1)
                .min(MAX_PAGES);
            if names.len() == before || page_no >= last_page {
                warn!(
                    "Service list paging stalled at page {} with {} of {} services, using what was collected",
                    page_no,
                    names.len(),
                    page.count.map_or_else(|| "?".to_string(), |c| c.to_string())
                );
                break;
            }
            page_no += 1;
        }
        debug!(
            "Retrieved {} services from namespace {} group {}",
            names.len(),
            namespace,
            group
        );
        Ok(names)
    }

    async fn list_instances(
        &self,
        service: &str,
        namespace: &str,
        group: &str,
    ) -> Result<Vec<Instance>> {
        let params = [
            ("namespaceId", namespace.to_string()),
            ("serviceName", service.to_string()),
            ("groupName", group.to_string()),
            ("clusters", String::new()),
            ("healthyOnly", "false".to_string()),
        ];
        let list: InstanceList = self
            .get_json(INSTANCE_LIST_PATH, &params, Some(service))
            .await?;
        debug!(
            "Retrieved {} instances for service {}",
            list.hosts.len(),
            service
        );
        Ok(list.hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn config_for(server: &MockServer) -> Config {
        Config {
            server: server.uri(),
            request_timeout_secs: 1,
            ..Config::default()
        }
    }

    fn login_ok(token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": token,
            "tokenTtl": 18000,
            "globalAdmin": true,
            "username": "nacos"
        }))
    }

    fn login() -> wiremock::MockBuilder {
        Mock::given(method("POST")).and(path("/nacos/v1/auth/login"))
    }

    fn service_list() -> wiremock::MockBuilder {
        Mock::given(method("GET")).and(path("/nacos/v1/ns/service/list"))
    }

    fn instance_list() -> wiremock::MockBuilder {
        Mock::given(method("GET")).and(path("/nacos/v1/ns/instance/list"))
    }

    #[tokio::test]
    async fn logs_in_lazily_and_reuses_the_token() {
        let server = MockServer::start().await;
        login()
            .and(body_string_contains("username=nacos"))
            .and(body_string_contains("password=nacos"))
            .respond_with(login_ok("t1"))
            .expect(1)
            .mount(&server)
            .await;
        service_list()
            .and(query_param("accessToken", "t1"))
            .and(query_param("namespaceId", "dev"))
            .and(query_param("groupName", "DEFAULT_GROUP"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 2, "doms": ["web", "api"]})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        for _ in 0..2 {
            let services = registry.list_services("dev", "DEFAULT_GROUP").await.unwrap();
            assert_eq!(
                services.into_iter().collect::<Vec<_>>(),
                vec!["api".to_string(), "web".to_string()]
            );
        }
    }

    #[tokio::test]
    async fn rejected_token_triggers_one_relogin_and_retry() {
        let server = MockServer::start().await;
        login()
            .respond_with(login_ok("stale"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        login()
            .respond_with(login_ok("fresh"))
            .expect(1)
            .mount(&server)
            .await;
        service_list()
            .and(query_param("accessToken", "stale"))
            .respond_with(ResponseTemplate::new(403).set_body_string("token expired!"))
            .mount(&server)
            .await;
        service_list()
            .and(query_param("accessToken", "fresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 1, "doms": ["api"]})),
            )
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let services = registry.list_services("dev", "DEFAULT_GROUP").await.unwrap();
        assert!(services.contains("api"));
    }

    #[tokio::test]
    async fn second_rejection_is_an_auth_failure() {
        let server = MockServer::start().await;
        login()
            .respond_with(login_ok("t1"))
            .expect(2)
            .mount(&server)
            .await;
        service_list()
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(2)
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let err = registry
            .list_services("dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn bad_credentials_are_an_auth_failure() {
        let server = MockServer::start().await;
        login()
            .respond_with(ResponseTemplate::new(403).set_body_string("unknown user!"))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let err = registry
            .list_services("dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn login_without_token_is_an_auth_failure() {
        let server = MockServer::start().await;
        login()
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"globalAdmin": false})))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let err = registry
            .list_instances("api", "dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_registry_is_unreachable() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        service_list()
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"count": 0, "doms": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let err = registry
            .list_services("dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnreachable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let config = Config {
            server: "http://127.0.0.1:1".into(),
            request_timeout_secs: 1,
            ..Config::default()
        };

        let registry = NacosRegistry::new(&config).unwrap();
        let err = registry
            .list_services("dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnreachable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn walks_every_service_page() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        let first: Vec<String> = (0..100).map(|i| format!("svc-{i:03}")).collect();
        let second: Vec<String> = (100..150).map(|i| format!("svc-{i:03}")).collect();
        service_list()
            .and(query_param("pageNo", "1"))
            .and(query_param("pageSize", "100"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 150, "doms": first})),
            )
            .expect(1)
            .mount(&server)
            .await;
        service_list()
            .and(query_param("pageNo", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 150, "doms": second})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let services = registry.list_services("dev", "DEFAULT_GROUP").await.unwrap();
        assert_eq!(services.len(), 150);
        assert!(services.contains("svc-149"));
    }

    #[tokio::test]
    async fn repeated_full_page_stops_paging() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        let page: Vec<String> = (0..100).map(|i| format!("svc-{i:03}")).collect();
        service_list()
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 150, "doms": page})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let services = tokio::time::timeout(
            Duration::from_secs(5),
            registry.list_services("dev", "DEFAULT_GROUP"),
        )
        .await
        .expect("paging did not terminate")
        .unwrap();
        assert_eq!(services.len(), 100);
    }

    /// Serves page `n` as names `n..n + 100`, so every page adds exactly one
    /// new name and `count` is never reached.
    struct SlidingPages;

    impl Respond for SlidingPages {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let page_no: usize = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "pageNo")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            let doms: Vec<String> = (page_no..page_no + 100)
                .map(|i| format!("svc-{i:03}"))
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({"count": 150, "doms": doms}))
        }
    }

    #[tokio::test]
    async fn overlapping_pages_stop_after_the_expected_page_count() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        service_list()
            .respond_with(SlidingPages)
            .expect(3)
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let services = tokio::time::timeout(
            Duration::from_secs(5),
            registry.list_services("dev", "DEFAULT_GROUP"),
        )
        .await
        .expect("paging did not terminate")
        .unwrap();
        assert_eq!(services.len(), 102);
    }

    #[tokio::test]
    async fn decodes_instance_list() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        instance_list()
            .and(query_param("serviceName", "api"))
            .and(query_param("healthyOnly", "false"))
            .and(query_param("accessToken", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "DEFAULT_GROUP@@api",
                "groupName": "DEFAULT_GROUP",
                "clusters": "",
                "cacheMillis": 10000,
                "hosts": [
                    {"ip": "10.0.0.1", "port": 9090, "healthy": true, "enabled": true, "metadata": {}},
                    {"ip": "10.0.0.2", "port": 9090, "healthy": false, "enabled": true, "metadata": {"zone": "b"}}
                ]
            })))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let instances = registry
            .list_instances("api", "dev", "DEFAULT_GROUP")
            .await
            .unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address(), "10.0.0.1:9090");
        assert!(instances[0].healthy);
        assert!(!instances[1].healthy);
        assert_eq!(instances[1].metadata.get("zone").map(String::as_str), Some("b"));
    }

    #[tokio::test]
    async fn vanished_service_is_not_found() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        instance_list()
            .and(query_param("serviceName", "ghost"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("caused: service not found: DEFAULT_GROUP@@ghost;"),
            )
            .mount(&server)
            .await;
        instance_list()
            .and(query_param("serviceName", "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        for service in ["ghost", "gone"] {
            let err = registry
                .list_instances(service, "dev", "DEFAULT_GROUP")
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::ServiceNotFound { service: ref s } if s == service),
                "got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn server_errors_are_unreachable() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).mount(&server).await;
        service_list()
            .respond_with(ResponseTemplate::new(503).set_body_string("server is starting"))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let err = registry
            .list_services("dev", "DEFAULT_GROUP")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryUnreachable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_relogin() {
        let server = MockServer::start().await;
        login()
            .respond_with(login_ok("stale"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        login()
            .respond_with(login_ok("fresh"))
            .expect(1)
            .mount(&server)
            .await;
        instance_list()
            .and(query_param("accessToken", "stale"))
            .respond_with(ResponseTemplate::new(403).set_body_string("token expired!"))
            .mount(&server)
            .await;
        instance_list()
            .and(query_param("accessToken", "fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hosts": [{"ip": "10.0.0.1", "port": 9090, "healthy": true}]
            })))
            .mount(&server)
            .await;

        let registry = NacosRegistry::new(&config_for(&server)).unwrap();
        let services = ["a", "b", "c", "d"];
        let results = join_all(
            services
                .iter()
                .map(|s| registry.list_instances(s, "dev", "DEFAULT_GROUP")),
        )
        .await;
        for result in results {
            assert_eq!(result.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn empty_username_skips_login() {
        let server = MockServer::start().await;
        login().respond_with(login_ok("t1")).expect(0).mount(&server).await;
        service_list()
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"count": 1, "doms": ["api"]})),
            )
            .mount(&server)
            .await;

        let config = Config {
            username: String::new(),
            ..config_for(&server)
        };
        let registry = NacosRegistry::new(&config).unwrap();
        let services = registry.list_services("dev", "DEFAULT_GROUP").await.unwrap();
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let config = Config {
            server: "http://nacos.internal:8848/proxy".into(),
            ..Config::default()
        };
        let registry = NacosRegistry::new(&config).unwrap();
        assert_eq!(
            registry.endpoint(LOGIN_PATH).unwrap().as_str(),
            "http://nacos.internal:8848/proxy/nacos/v1/auth/login"
        );
    }
}
