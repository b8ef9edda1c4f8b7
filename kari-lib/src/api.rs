//! REST control façade.
//!
//! Hand-routed hyper service exposing the engine: every response carries
//! `{"success": bool, ...}` and failures map to 4xx/5xx by error class.

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bgp::{BgpConfig, Route};
use crate::config::EngineSnapshot;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::netflow::NetflowConfig;
use crate::rfc2544::{HarnessOptions, TestKind};

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Serves the control API until the shutdown channel fires.
pub async fn serve(
    engine: Arc<Engine>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "control api listening");
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            res = shutdown.changed() => {
                if res.is_ok() {
                    info!("shutdown signal received, stopping control api");
                    break;
                }
                continue;
            }
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "control api accept failed");
                continue;
            }
        };
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                let engine = Arc::clone(&engine);
                async move { Ok::<_, hyper::Error>(handle(engine, req).await) }
            });
            let builder = ConnBuilder::new(TokioExecutor::new());
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                warn!(?peer, error = %e, "control api connection error");
            }
        });
    }
    Ok(())
}

fn boxed(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, value: Value) -> ApiResponse {
    let bytes = Bytes::from(serde_json::to_vec(&value).unwrap_or_default());
    let mut resp = Response::new(boxed(bytes));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn ok_response(mut value: Value) -> ApiResponse {
    if let Value::Object(map) = &mut value {
        map.insert("success".into(), Value::Bool(true));
    }
    json_response(StatusCode::OK, value)
}

fn error_response(err: &EngineError) -> ApiResponse {
    let status = match err {
        EngineError::Config(_) | EngineError::Codec(_) | EngineError::FeatureUnavailable(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::UnknownInterface(_) | EngineError::UnknownProfile(_) => StatusCode::NOT_FOUND,
        EngineError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Transport(_) | EngineError::Io(_) | EngineError::Fatal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_response(
        status,
        json!({"success": false, "error": err.to_string()}),
    )
}

fn not_found() -> ApiResponse {
    json_response(
        StatusCode::NOT_FOUND,
        json!({"success": false, "error": "no such endpoint"}),
    )
}

fn respond<T: serde::Serialize>(key: &str, result: Result<T>) -> ApiResponse {
    match result {
        Ok(value) => ok_response(json!({ key: value })),
        Err(err) => error_response(&err),
    }
}

fn parse_body<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::Config(format!("invalid request body: {e}")))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Rfc2544StartRequest {
    profile: String,
    #[serde(default)]
    tests: Vec<TestKind>,
    #[serde(default)]
    duration_secs: Option<u64>,
    #[serde(default)]
    frame_sizes: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutesRequest {
    routes: Vec<Route>,
}

async fn handle(engine: Arc<Engine>, req: Request<Incoming>) -> ApiResponse {
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(&EngineError::Transport(format!("body read failed: {e}")))
        }
    };
    let path = parts.uri.path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (parts.method.as_str(), segments.as_slice()) {
        ("GET", ["metrics"]) => {
            let mut resp = Response::new(boxed(Bytes::from(engine.prometheus_text())));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }

        ("GET", ["api", "interfaces"]) => {
            ok_response(json!({"interfaces": engine.list_interfaces()}))
        }
        ("POST", ["api", "interfaces"]) => match parse_body(&bytes) {
            Ok(cfg) => respond("interface", engine.admit_interface(cfg)),
            Err(err) => error_response(&err),
        },
        ("GET", ["api", "interfaces", name]) => {
            respond("interface", engine.interface(name).map(|i| i.config()))
        }
        ("POST", ["api", "interfaces", name, "discover"]) => {
            respond("interface", engine.discover_interface(name))
        }

        ("GET", ["api", "capabilities"]) | ("GET", ["api", "features", "status"]) => {
            ok_response(engine.capabilities())
        }

        ("GET", ["api", "traffic-profiles"]) => {
            ok_response(json!({"profiles": engine.list_profiles()}))
        }
        ("POST", ["api", "traffic-profiles"]) => match parse_body(&bytes) {
            Ok(profile) => respond("added", engine.add_profile(profile).map(|_| true)),
            Err(err) => error_response(&err),
        },
        ("GET", ["api", "traffic-profiles", name]) => {
            respond("profile", engine.profile(name))
        }
        ("PUT", ["api", "traffic-profiles", name]) => match parse_body(&bytes) {
            Ok(profile) => respond("updated", engine.update_profile(name, profile).map(|_| true)),
            Err(err) => error_response(&err),
        },
        ("DELETE", ["api", "traffic-profiles", name]) => {
            respond("removed", engine.remove_profile(name).map(|_| true))
        }

        ("POST", ["api", "traffic", "start"]) => {
            respond("workers", engine.start_traffic())
        }
        ("POST", ["api", "traffic", "stop"]) => {
            engine.stop_traffic();
            ok_response(json!({}))
        }
        ("GET", ["api", "traffic", "stats"]) => ok_response(json!({"stats": engine.stats()})),

        ("GET", ["api", "config"]) | ("POST", ["api", "config"]) => {
            ok_response(json!({"config": engine.snapshot()}))
        }
        ("POST", ["api", "config", "load"]) => match parse_body::<EngineSnapshot>(&bytes) {
            Ok(snapshot) => respond("restored", engine.restore(snapshot).map(|_| true)),
            Err(err) => error_response(&err),
        },

        ("POST", ["api", "rfc2544", "start"]) => {
            match parse_body::<Rfc2544StartRequest>(&bytes) {
                Ok(req) => {
                    let kinds = if req.tests.is_empty() {
                        vec![
                            TestKind::Throughput,
                            TestKind::Latency,
                            TestKind::FrameLoss,
                            TestKind::BackToBack,
                        ]
                    } else {
                        req.tests
                    };
                    let opts = (req.duration_secs.is_some() || req.frame_sizes.is_some()).then(
                        || {
                            let mut opts = HarnessOptions::default();
                            if let Some(secs) = req.duration_secs {
                                opts.trial_duration = Duration::from_secs(secs);
                            }
                            if let Some(sizes) = req.frame_sizes {
                                opts.frame_sizes = sizes;
                            }
                            opts
                        },
                    );
                    respond(
                        "started",
                        engine.start_rfc2544(&req.profile, kinds, opts).map(|_| true),
                    )
                }
                Err(err) => error_response(&err),
            }
        }
        ("POST", ["api", "rfc2544", "stop"]) => {
            engine.cancel_rfc2544();
            ok_response(json!({}))
        }
        ("GET", ["api", "rfc2544", "results", name]) => match engine.rfc2544_results(name) {
            Some(report) => ok_response(json!({"results": report})),
            None => error_response(&EngineError::UnknownProfile(name.to_string())),
        },

        ("POST", ["api", "impairments", "enable"]) => {
            engine.set_impairments_enabled(true);
            ok_response(json!({"impairments": true}))
        }
        ("POST", ["api", "impairments", "disable"]) => {
            engine.set_impairments_enabled(false);
            ok_response(json!({"impairments": false}))
        }

        ("POST", ["api", "bgp", "start"]) => match parse_body::<BgpConfig>(&bytes) {
            Ok(cfg) => respond("bgp", engine.start_bgp(cfg).await),
            Err(err) => error_response(&err),
        },
        ("POST", ["api", "bgp", "advertise"]) => match parse_body::<RoutesRequest>(&bytes) {
            Ok(req) => respond("updates", engine.bgp_advertise(&req.routes).await),
            Err(err) => error_response(&err),
        },
        ("POST", ["api", "bgp", "withdraw"]) => match parse_body::<RoutesRequest>(&bytes) {
            Ok(req) => respond("withdrawn", engine.bgp_withdraw(&req.routes).await.map(|_| true)),
            Err(err) => error_response(&err),
        },
        ("POST", ["api", "bgp", "stop"]) => {
            respond("stopped", engine.stop_bgp().await.map(|_| true))
        }

        ("POST", ["api", "netflow", "start"]) => match parse_body::<NetflowConfig>(&bytes) {
            Ok(cfg) => respond("started", engine.start_netflow(cfg).map(|_| true)),
            Err(err) => error_response(&err),
        },
        ("POST", ["api", "netflow", "stop"]) => {
            respond("stopped", engine.stop_netflow().map(|_| true))
        }

        ("POST", ["api", "qos", "test"]) => {
            error_response(&EngineError::FeatureUnavailable("qos validation"))
        }
        ("POST", ["api", "snmp", _]) => {
            error_response(&EngineError::FeatureUnavailable("snmp agent farm"))
        }

        _ => not_found(),
    }
}
