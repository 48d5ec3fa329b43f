//! Redirection, KVM and user consent settings

use super::{item, with_fields};
use crate::device::{Device, DeviceSession};
use crate::engine::{expect_zero, Machine, State};
use crate::error::{Fault, Result};
use crate::messages::DeviceStatus;
use rps_services::{ActivationMode, ActivationProfile};
use rps_wsman::{as_bool, as_i64, Envelope, WsmanCall};
use serde_json::{json, Value};

pub const NAME: &str = "features";

const REDIRECTION_SERVICE: &str = "AMT_RedirectionService";
const KVM_REDIRECTION_SAP: &str = "CIM_KVMRedirectionSAP";
const OPT_IN_SERVICE: &str = "IPS_OptInService";

const KVM_ENABLED: i64 = 2;
const KVM_DISABLED: i64 = 3;
const KVM_ENABLED_BUT_OFFLINE: i64 = 6;

/// Per-run state of the features workflow
#[derive(Debug)]
pub struct FeaturesContext {
    profile: ActivationProfile,
    mode: ActivationMode,
    redirection: Value,
    kvm_state: Option<i64>,
    opt_in: Value,
}

impl FeaturesContext {
    pub fn new(profile: ActivationProfile, mode: ActivationMode) -> Self {
        Self {
            profile,
            mode,
            redirection: Value::Null,
            kvm_state: None,
            opt_in: Value::Null,
        }
    }

    fn listener_wanted(&self) -> bool {
        self.profile.ider_enabled || self.profile.sol_enabled || self.profile.kvm_enabled
    }
}

type S = State<FeaturesContext>;

pub fn machine() -> Machine<FeaturesContext> {
    Machine::new(NAME, "GET_REDIRECTION_SERVICE")
        .state(
            S::call(
                "GET_REDIRECTION_SERVICE",
                |_, _| Ok(WsmanCall::get(REDIRECTION_SERVICE)),
                |c, envelope| {
                    c.redirection = item(envelope, REDIRECTION_SERVICE)?.clone();
                    Ok(())
                },
            )
            .then("GET_KVM_REDIRECTION_SAP"),
        )
        .state(
            S::call(
                "GET_KVM_REDIRECTION_SAP",
                |_, _| Ok(WsmanCall::get(KVM_REDIRECTION_SAP)),
                |c, envelope| {
                    c.kvm_state = as_i64(&item(envelope, KVM_REDIRECTION_SAP)?["EnabledState"]);
                    Ok(())
                },
            )
            .then("GET_OPT_IN_SERVICE"),
        )
        .state(
            S::call(
                "GET_OPT_IN_SERVICE",
                |_, _| Ok(WsmanCall::get(OPT_IN_SERVICE)),
                |c, envelope| {
                    c.opt_in = item(envelope, OPT_IN_SERVICE)?.clone();
                    Ok(())
                },
            )
            .then("CHECK_REDIRECTION"),
        )
        .state(
            S::decide("CHECK_REDIRECTION")
                .when("redirectionDiffers", redirection_differs, "SET_REDIRECTION_STATE")
                .then("CHECK_KVM"),
        )
        .state(
            S::call(
                "SET_REDIRECTION_STATE",
                |c, _| {
                    Ok(WsmanCall::invoke(
                        REDIRECTION_SERVICE,
                        "RequestStateChange",
                        json!({ "RequestedState": c.profile.redirection_state() }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "RequestStateChange"),
            )
            .then("PUT_REDIRECTION_SERVICE"),
        )
        .state(S::call("PUT_REDIRECTION_SERVICE", put_redirection, |_, _| Ok(())).then("CHECK_KVM"))
        .state(
            S::decide("CHECK_KVM")
                .when("kvmDiffers", kvm_differs, "SET_KVM_STATE")
                .then("CHECK_OPT_IN"),
        )
        .state(
            S::call(
                "SET_KVM_STATE",
                |c, _| {
                    let state = if c.profile.kvm_enabled { KVM_ENABLED } else { KVM_DISABLED };
                    Ok(WsmanCall::invoke(
                        KVM_REDIRECTION_SAP,
                        "RequestStateChange",
                        json!({ "RequestedState": state }),
                    ))
                },
                |_, envelope| expect_zero(envelope, "RequestStateChange"),
            )
            .then("CHECK_OPT_IN"),
        )
        .state(
            S::decide("CHECK_OPT_IN")
                .when("optInDiffers", opt_in_differs, "PUT_OPT_IN_SERVICE")
                .then("SUCCESS"),
        )
        .state(S::call("PUT_OPT_IN_SERVICE", put_opt_in, check_opt_in).then("SUCCESS"))
        .state(S::success("SUCCESS"))
}

/// Run as a child of activation, recording the `Features` status
pub async fn run(device: &mut Device, profile: &ActivationProfile, mode: ActivationMode) -> Result<()> {
    let mut ctx = FeaturesContext::new(profile.clone(), mode);
    let result = machine().run(&mut ctx, device).await.into_result();
    let status = match &result {
        Ok(()) => "Configured".to_string(),
        Err(fault) => fault.to_string(),
    };
    device.session.status.set(DeviceStatus::FEATURES, status);
    result
}

fn redirection_differs(ctx: &FeaturesContext) -> bool {
    let state = as_i64(&ctx.redirection["EnabledState"]);
    let listener = as_bool(&ctx.redirection["ListenerEnabled"]).unwrap_or(false);
    state != Some(i64::from(ctx.profile.redirection_state())) || listener != ctx.listener_wanted()
}

fn put_redirection(ctx: &FeaturesContext, _: &DeviceSession) -> Result<WsmanCall> {
    Ok(WsmanCall::put(
        REDIRECTION_SERVICE,
        with_fields(&ctx.redirection, json!({ "ListenerEnabled": ctx.listener_wanted() })),
    ))
}

fn kvm_differs(ctx: &FeaturesContext) -> bool {
    let enabled = matches!(ctx.kvm_state, Some(KVM_ENABLED) | Some(KVM_ENABLED_BUT_OFFLINE));
    enabled != ctx.profile.kvm_enabled
}

/// Only admin control mode may change user consent
fn opt_in_differs(ctx: &FeaturesContext) -> bool {
    ctx.mode == ActivationMode::Admin
        && as_i64(&ctx.opt_in["OptInRequired"]) != Some(i64::from(ctx.profile.user_consent.opt_in_required()))
}

fn put_opt_in(ctx: &FeaturesContext, _: &DeviceSession) -> Result<WsmanCall> {
    Ok(WsmanCall::put(
        OPT_IN_SERVICE,
        with_fields(&ctx.opt_in, json!({ "OptInRequired": ctx.profile.user_consent.opt_in_required() })),
    ))
}

fn check_opt_in(ctx: &mut FeaturesContext, envelope: &Envelope) -> Result<()> {
    let applied = as_i64(&item(envelope, OPT_IN_SERVICE)?["OptInRequired"]);
    if applied != Some(i64::from(ctx.profile.user_consent.opt_in_required())) {
        return Err(Fault::failed("Failed to update user consent"));
    }
    Ok(())
}
