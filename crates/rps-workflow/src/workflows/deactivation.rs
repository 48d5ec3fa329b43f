//! Return an activated device to pre-provisioning mode

use super::SETUP_AND_CONFIGURATION_SERVICE;
use crate::device::Device;
use crate::engine::{expect_zero, Machine, Outcome, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use futures::future::BoxFuture;
use rps_services::DeviceSecrets;
use rps_wsman::WsmanCall;
use serde_json::json;
use tracing::{info, warn};

pub const NAME: &str = "deactivation";

/// Full unprovision
const PROVISIONING_MODE_FULL: u8 = 1;

/// Per-run state of the deactivation workflow
#[derive(Debug, Default)]
pub struct DeactivationContext {
    /// Control mode the client reported; 0 is pre-provisioning
    pub current_mode: u8,
    pub password_from_store: bool,
}

type S = State<DeactivationContext>;

pub fn machine() -> Machine<DeactivationContext> {
    Machine::new(NAME, "CHECK_ACTIVATED")
        .state(
            S::decide("CHECK_ACTIVATED")
                .when("notActivated", |c| c.current_mode == 0, "NOT_ACTIVATED")
                .then("GET_SECRET"),
        )
        .state(S::failure("NOT_ACTIVATED", |_| Fault::failed("Device is not activated")))
        .state(S::task("GET_SECRET", load_credentials).then("UNPROVISION"))
        .state(
            S::call(
                "UNPROVISION",
                |_, _| {
                    Ok(WsmanCall::invoke(
                        SETUP_AND_CONFIGURATION_SERVICE,
                        "Unprovision",
                        json!({ "ProvisioningMode": PROVISIONING_MODE_FULL }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "Unprovision"),
            )
            .then("DELETE_SECRET"),
        )
        .state(S::task("DELETE_SECRET", delete_secret).then("UNREGISTER"))
        .state(S::task("UNREGISTER", unregister).then("SUCCESS"))
        .state(S::success("SUCCESS"))
}

/// Run deactivation as a top-level workflow, recording `Status`
pub async fn run(device: &mut Device) -> Outcome {
    let mut ctx = DeactivationContext {
        current_mode: device.session.payload.current_mode,
        ..Default::default()
    };
    let outcome = machine().run(&mut ctx, device).await;
    let status = match &outcome {
        Outcome::Success => "Deactivated".to_string(),
        Outcome::Failed(fault) => fault.to_string(),
    };
    device.session.status.set(DeviceStatus::STATUS, status);
    outcome
}

/// Authenticate as admin with the stored password, falling back to the
/// one the client sent
fn load_credentials<'a>(ctx: &'a mut DeactivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let guid = device.session.uuid().to_string();
        let stored = DeviceSecrets::load(device.services.secrets.as_ref(), &guid)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))?
            .and_then(|secrets| secrets.amt_password);
        ctx.password_from_store = stored.is_some();
        let password = stored
            .or_else(|| device.session.payload.password.as_ref().map(|p| p.expose().to_string()))
            .ok_or_else(|| Fault::failed(format!("No AMT password known for device {guid}")))?;
        let username = device.engine_config().admin_username.clone();
        device.session.connection.set_credentials(username, password);
        Ok(())
    })
}

fn delete_secret<'a>(_ctx: &'a mut DeactivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let path = DeviceSecrets::path(device.session.uuid());
        device
            .services
            .secrets
            .delete_secret(&path)
            .await
            .map_err(|e| Fault::collaborator("secret store", e))
    })
}

/// The device is already unprovisioned, so a broker failure is only logged
fn unregister<'a>(ctx: &'a mut DeactivationContext, device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let guid = device.session.uuid().to_string();
        match device.services.broker.unregister(&guid).await {
            Ok(()) => info!(client_id = %device.client_id(), %guid, from_store = ctx.password_from_store, "Device deactivated"),
            Err(e) => warn!(client_id = %device.client_id(), %guid, error = %e, "Failed to unregister device from MPS"),
        }
        Ok(())
    })
}
