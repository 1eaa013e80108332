//! Alpaca HTTP surface: the focuser endpoint dispatch, management API,
//! driver-specific GUI API, and the UDP discovery responder.

mod discovery;
pub use discovery::{DiscoveryServer, DEFAULT_DISCOVERY_PORT};

mod transaction;
pub(crate) use transaction::{RequestTransaction, ResponseTransaction};

mod params;
pub(crate) use params::ActionParams;

mod response;
pub(crate) use response::{OpaqueResponse, Response, ValueResponse};

mod error;
pub(crate) use error::Error;

mod gui;

use crate::errors::DriverError;
use crate::focuser::FocuserController;
use axum::extract::Path;
use axum::http::Uri;
use axum::routing::MethodFilter;
use axum::Router;
use serde::Serialize;
use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

/// Fixed identity strings of this driver.
const DEVICE_NAME: &str = "Robofocus";
const DEVICE_DESCRIPTION: &str = "Robofocus Electronic Focuser";
const DRIVER_INFO: &str = "ASCOM Alpaca driver for the Robofocus electronic focuser";
const DEVICE_UNIQUE_ID: &str = "9d4bd53e-6c18-4d57-b2dc-0f5d04a1f0e6";

/// `IFocuserV3`: the interface level that includes backlash.
const INTERFACE_VERSION: i32 = 3;

/// General information about the server, served by `/management/v1/description`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub server_name: Cow<'static, str>,
    pub manufacturer: Cow<'static, str>,
    pub manufacturer_version: Cow<'static, str>,
    pub location: Cow<'static, str>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_name: Cow::Borrowed(env!("CARGO_PKG_NAME")),
            manufacturer: Cow::Borrowed(env!("CARGO_PKG_AUTHORS")),
            manufacturer_version: Cow::Borrowed(env!("CARGO_PKG_VERSION")),
            location: Cow::Borrowed(env!("CARGO_PKG_REPOSITORY")),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConfiguredDevice {
    #[serde(rename = "DeviceName")]
    name: &'static str,
    #[serde(rename = "DeviceType")]
    device_type: &'static str,
    #[serde(rename = "DeviceNumber")]
    number: usize,
    #[serde(rename = "UniqueID")]
    unique_id: &'static str,
}

#[derive(Debug)]
pub struct Server {
    pub controller: Arc<FocuserController>,
    pub info: ServerInfo,
    pub listen_addr: SocketAddr,
    pub discovery_port: u16,
    pub discovery_enabled: bool,
}

async fn server_handler<Resp: Response, RespFut: Future<Output = Resp> + Send>(
    uri: Uri,
    mut raw_params: ActionParams,
    make_response: impl FnOnce(ActionParams) -> RespFut + Send,
) -> axum::response::Response {
    let request_transaction = match RequestTransaction::extract(&mut raw_params) {
        Ok(transaction) => transaction,
        Err(err) => {
            return axum::response::IntoResponse::into_response((
                axum::http::StatusCode::BAD_REQUEST,
                format!("{err:#}"),
            ));
        }
    };
    let response_transaction = ResponseTransaction::new(request_transaction.client_transaction_id);

    let span = tracing::debug_span!(
        "Alpaca transaction",
        path = uri.path(),
        client_id = ?request_transaction.client_id,
        client_transaction_id = ?request_transaction.client_transaction_id,
        server_transaction_id = response_transaction.server_transaction_id.get(),
    );

    async move {
        make_response(raw_params)
            .await
            .into_axum(response_transaction)
    }
    .instrument(span)
    .await
}

impl Server {
    pub fn new(controller: Arc<FocuserController>, listen_addr: SocketAddr) -> Self {
        Self {
            controller,
            info: ServerInfo::default(),
            listen_addr,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_enabled: true,
        }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        // The bound address can differ, e.g. when using port 0.
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Alpaca server listening");

        let discovery_enabled = self.discovery_enabled;
        let discovery = DiscoveryServer {
            alpaca_port: addr.port(),
            discovery_port: self.discovery_port,
        };
        let router = self.into_router();

        tokio::try_join!(
            async move { axum::serve(listener, router).await.map_err(anyhow::Error::from) },
            async move {
                if discovery_enabled {
                    discovery.start().await
                } else {
                    std::future::pending().await
                }
            },
        )?;
        Ok(())
    }

    pub fn into_router(self) -> Router {
        let controller = self.controller;
        let info = Arc::new(self.info);

        Router::new()
            .route(
                "/management/apiversions",
                axum::routing::get(|uri, params| {
                    server_handler(uri, params, |_params| async move {
                        OpaqueResponse::new([1_u32])
                    })
                }),
            )
            .route("/management/v1/configureddevices", {
                axum::routing::get(|uri, params| {
                    server_handler(uri, params, |_params| async move {
                        OpaqueResponse::new(ValueResponse::from([ConfiguredDevice {
                            name: DEVICE_NAME,
                            device_type: "Focuser",
                            number: 0,
                            unique_id: DEVICE_UNIQUE_ID,
                        }]))
                    })
                })
            })
            .route(
                "/management/v1/description",
                axum::routing::get(move |uri, params| {
                    let info = ServerInfo::clone(&info);
                    server_handler(uri, params, |_params| async move {
                        OpaqueResponse::new(ValueResponse::from(info))
                    })
                }),
            )
            .route(
                "/api/v1/focuser/0/:action",
                axum::routing::on(MethodFilter::GET.or(MethodFilter::PUT), {
                    let controller = Arc::clone(&controller);
                    move |uri, Path(action): Path<String>, params: ActionParams| {
                        let controller = Arc::clone(&controller);
                        async move {
                            server_handler(uri, params, |params| {
                                handle_action(controller, action, params)
                            })
                            .await
                        }
                    }
                }),
            )
            .nest("/gui", gui::router(controller))
    }
}

/// Maps an Alpaca focuser action to a controller call and wraps the result.
/// Unknown action names and malformed parameters become HTTP 400s; device
/// errors travel in the envelope.
async fn handle_action(
    controller: Arc<FocuserController>,
    action: String,
    mut params: ActionParams,
) -> error::Result<OpaqueResponse> {
    let response = match (action.as_str(), &mut params) {
        ("connected", ActionParams::Get(_)) => {
            OpaqueResponse::new(controller.is_connected().await)
        }
        ("connected", ActionParams::Put(params)) => {
            let connected: bool = params.extract("Connected")?;
            if connected {
                controller.connect().await?;
            } else {
                controller.disconnect().await?;
            }
            OpaqueResponse::new(())
        }
        ("position", ActionParams::Get(_)) => OpaqueResponse::new(controller.position().await?),
        ("ismoving", ActionParams::Get(_)) => OpaqueResponse::new(controller.is_moving().await),
        ("move", ActionParams::Put(params)) => {
            let position: i32 = params.extract("Position")?;
            controller.move_to(position).await?;
            OpaqueResponse::new(())
        }
        ("halt", ActionParams::Put(_)) => {
            controller.halt().await?;
            OpaqueResponse::new(())
        }
        ("temperature", ActionParams::Get(_)) => {
            OpaqueResponse::new(controller.temperature().await?)
        }
        ("maxstep", ActionParams::Get(_)) => OpaqueResponse::new(controller.max_step().await),
        ("maxincrement", ActionParams::Get(_)) => {
            OpaqueResponse::new(i32::try_from(controller.max_increment()).unwrap_or(i32::MAX))
        }
        ("stepsize", ActionParams::Get(_)) => OpaqueResponse::new(controller.step_size()),
        ("absolute", ActionParams::Get(_)) => OpaqueResponse::new(true),
        ("backlash", ActionParams::Get(_)) => {
            OpaqueResponse::new(i32::from(controller.backlash().await?))
        }
        ("backlash", ActionParams::Put(params)) => {
            let backlash: i32 = params.extract("Backlash")?;
            let backlash = i16::try_from(backlash).map_err(|_| {
                DriverError::InvalidValue(format!("backlash {backlash} out of range"))
            })?;
            controller.set_backlash(backlash).await?;
            OpaqueResponse::new(())
        }
        ("tempcomp", ActionParams::Get(_)) => OpaqueResponse::new(false),
        ("tempcomp", ActionParams::Put(params)) => {
            let temp_comp: bool = params.extract("TempComp")?;
            if temp_comp {
                return Err(DriverError::InvalidOperation(
                    "temperature compensation is not available".to_owned(),
                )
                .into());
            }
            OpaqueResponse::new(())
        }
        ("tempcompavailable", ActionParams::Get(_)) => OpaqueResponse::new(false),
        ("interfaceversion", ActionParams::Get(_)) => OpaqueResponse::new(INTERFACE_VERSION),
        ("driverversion", ActionParams::Get(_)) => {
            OpaqueResponse::new(env!("CARGO_PKG_VERSION"))
        }
        ("driverinfo", ActionParams::Get(_)) => OpaqueResponse::new(DRIVER_INFO),
        ("description", ActionParams::Get(_)) => OpaqueResponse::new(DEVICE_DESCRIPTION),
        ("name", ActionParams::Get(_)) => OpaqueResponse::new(DEVICE_NAME),
        ("supportedactions", ActionParams::Get(_)) => {
            OpaqueResponse::new(Vec::<String>::new())
        }
        _ => {
            return Err(Error::UnknownAction {
                action: action.clone(),
            })
        }
    };
    params.finish_extraction();
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::errors::AscomErrorCode;
    use crate::protocol::ProtocolLog;
    use crate::settings::{Mode, SettingsStore, UserSettings};
    use indexmap::IndexMap;

    fn controller() -> Arc<FocuserController> {
        let cfg = AppConfig::default();
        let settings = Arc::new(SettingsStore::in_memory(UserSettings::default()));
        FocuserController::new(cfg, settings, Arc::new(ProtocolLog::default()), Some(Mode::Simulator))
    }

    fn empty_get() -> ActionParams {
        ActionParams::Get(serde_json::from_str("{}").expect("empty map"))
    }

    fn put(pairs: &[(&str, &str)]) -> ActionParams {
        let map: IndexMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ActionParams::Put(serde_json::from_value(serde_json::to_value(map).expect("map")).expect("params"))
    }

    #[tokio::test]
    async fn fixed_value_endpoints() {
        let controller = controller();
        let response = handle_action(Arc::clone(&controller), "absolute".to_owned(), empty_get())
            .await
            .expect("absolute");
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!(true)));

        let response = handle_action(
            Arc::clone(&controller),
            "interfaceversion".to_owned(),
            empty_get(),
        )
        .await
        .expect("interfaceversion");
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!(3)));

        let response = handle_action(Arc::clone(&controller), "name".to_owned(), empty_get())
            .await
            .expect("name");
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!("Robofocus")));

        let response = handle_action(
            Arc::clone(&controller),
            "supportedactions".to_owned(),
            empty_get(),
        )
        .await
        .expect("supportedactions");
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!([])));
    }

    #[tokio::test]
    async fn unknown_action_is_a_dispatch_error() {
        let err = handle_action(controller(), "slewtoaltaz".to_owned(), empty_get())
            .await
            .expect_err("unknown");
        assert!(matches!(err, Error::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn device_errors_map_to_envelope_codes() {
        let controller = controller();
        // Not connected yet: position must fail with 1031.
        let err = handle_action(Arc::clone(&controller), "position".to_owned(), empty_get())
            .await
            .expect_err("disconnected");
        match err {
            Error::Ascom(err) => assert_eq!(err.code, AscomErrorCode::NOT_CONNECTED),
            other => panic!("unexpected error {other:?}"),
        }

        let err = handle_action(
            Arc::clone(&controller),
            "move".to_owned(),
            put(&[("Position", "1000")]),
        )
        .await
        .expect_err("disconnected move");
        match err {
            Error::Ascom(err) => assert_eq!(err.code, AscomErrorCode::NOT_CONNECTED),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_parameter_is_a_bad_request_not_an_envelope() {
        let err = handle_action(controller(), "move".to_owned(), put(&[]))
            .await
            .expect_err("missing Position");
        assert!(matches!(err, Error::MissingParameter { name: "Position" }));
    }

    #[tokio::test]
    async fn connect_move_roundtrip_through_dispatch() {
        let controller = controller();
        handle_action(
            Arc::clone(&controller),
            "connected".to_owned(),
            put(&[("Connected", "true")]),
        )
        .await
        .expect("connect");
        assert!(controller.is_connected().await);

        let response = handle_action(Arc::clone(&controller), "maxstep".to_owned(), empty_get())
            .await
            .expect("maxstep");
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!(60_000)));

        handle_action(
            Arc::clone(&controller),
            "connected".to_owned(),
            put(&[("Connected", "false")]),
        )
        .await
        .expect("disconnect");
        assert!(!controller.is_connected().await);
    }
}
