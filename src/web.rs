use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use minijinja::{context, Environment};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::WebConfig;
use crate::power::PowerOrchestrator;

const INDEX_TEMPLATE: &str = "index.html";

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<PowerOrchestrator>,
    host: Arc<str>,
    templates: Arc<Environment<'static>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PowerOrchestrator>, host: &str) -> Result<Self> {
        let mut env = Environment::new();
        // .html names get HTML auto-escaping
        env.add_template(INDEX_TEMPLATE, include_str!("templates/index.html"))
            .context("invalid page template")?;
        Ok(Self { orchestrator, host: Arc::from(host), templates: Arc::new(env) })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/poweron", post(power_on))
        .with_state(state)
}

pub async fn bind(cfg: &WebConfig) -> Result<TcpListener> {
    TcpListener::bind((cfg.listen_addr, cfg.listen_port))
        .await
        .with_context(|| format!("failed to listen on TCP {}:{}", cfg.listen_addr, cfg.listen_port))
}

/// Serves until `token` is cancelled, then drains in-flight requests.
pub async fn serve(listener: TcpListener, state: AppState, token: CancellationToken) -> Result<()> {
    log::info!("[web] serving on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("web server failed")?;
    log::trace!("[web] exit");
    Ok(())
}

async fn index(State(state): State<AppState>) -> Response {
    let status = state.orchestrator.power_state().await;
    let page = state.templates
        .get_template(INDEX_TEMPLATE)
        .and_then(|tmpl| tmpl.render(context! {
            host => &*state.host,
            status => status.to_string(),
        }));
    match page {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            log::error!("[web] failed to render page: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error rendering page").into_response()
        }
    }
}

async fn power_on(State(state): State<AppState>) -> Response {
    log::info!("[web] power on requested");
    let outcome = state.orchestrator.trigger_power_on().await;
    if outcome.is_success() {
        log::info!("[web] {outcome}");
        Redirect::to("/").into_response()
    } else {
        log::warn!("[web] {outcome}");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Error powering on: {outcome}")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::header::LOCATION;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::power::testing::{FakeBmc, FakeController};

    fn state(bmc: &Arc<FakeBmc>) -> AppState {
        let orchestrator = PowerOrchestrator::new(
            Arc::new(FakeController(bmc.clone())),
            Duration::from_secs(2),
        );
        AppState::new(Arc::new(orchestrator), "bmc<1>.lan").unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn page_shows_off_server_with_power_button() {
        let bmc = Arc::new(FakeBmc::off());
        let page = body_text(index(State(state(&bmc))).await).await;

        assert!(page.contains("<strong>OFF</strong>"));
        assert!(page.contains(r#"action="/poweron""#));
        assert!(page.contains("Host: bmc&lt;1&gt;.lan"));
        assert!(!page.contains("window.location.reload"));
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
    }

    #[tokio::test]
    async fn page_disables_button_when_on() {
        let bmc = Arc::new(FakeBmc::on());
        let page = body_text(index(State(state(&bmc))).await).await;

        assert!(page.contains("<strong>ON</strong>"));
        assert!(page.contains("<button disabled>"));
        assert!(!page.contains(r#"action="/poweron""#));
    }

    #[tokio::test]
    async fn page_reloads_while_unknown() {
        let bmc = Arc::new(FakeBmc { refuse_connect: true, ..FakeBmc::default() });
        let page = body_text(index(State(state(&bmc))).await).await;

        assert!(page.contains("<strong>Unknown</strong>"));
        assert!(page.contains("window.location.reload"));
    }

    #[tokio::test]
    async fn power_on_redirects_home() {
        let bmc = Arc::new(FakeBmc::off());
        let resp = power_on(State(state(&bmc))).await;

        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[LOCATION], "/");
        assert_eq!(FakeBmc::count(&bmc.power_ons), 1);
    }

    #[tokio::test]
    async fn power_on_when_already_on_still_redirects() {
        let bmc = Arc::new(FakeBmc::on());
        let resp = power_on(State(state(&bmc))).await;

        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(FakeBmc::count(&bmc.power_ons), 0);
    }

    #[tokio::test]
    async fn failed_power_on_is_500_with_reason() {
        let bmc = Arc::new(FakeBmc { fail_command: true, ..FakeBmc::default() });
        let resp = power_on(State(state(&bmc))).await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(resp).await.starts_with("Error powering on:"));
    }

    async fn raw_request(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn server_routes_and_rejects_wrong_methods() {
        let bmc = Arc::new(FakeBmc::on());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, state(&bmc), token.clone()));

        let get_home = raw_request(addr, "GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(get_home.starts_with("HTTP/1.1 200"), "{get_home}");

        let get_poweron = raw_request(addr, "GET /poweron HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(get_poweron.starts_with("HTTP/1.1 405"), "{get_poweron}");

        let post = raw_request(addr, "POST /poweron HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        assert!(post.starts_with("HTTP/1.1 303"), "{post}");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap().unwrap();
    }
}
