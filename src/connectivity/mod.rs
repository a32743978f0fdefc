//! Connectivity probe: periodically re-checks this host's internet and UPnP reachability and
//! publishes the result (spec §4.6, §4.7). Runs as a background task for the lifetime of the
//! manager; never propagates errors out of its loop body (spec §1 ambient stack).

pub mod echo;
pub mod iface;
pub mod status;
pub mod upnp;

pub use status::{ConnectivityState, InternetConnectivityStatus, UPnPDeviceStatus};

use crate::config::ManagerConfig;
use iface::LocalInterface;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::Instrument;

/// Spawns the probe loop, returning a sender (so callers outside the probe, like the acceptor, can
/// poke in observations such as "we just received a live inbound connection"), a receiver that
/// always holds the latest [`ConnectivityState`], and a handle to the background task (aborted on
/// manager shutdown).
pub fn spawn(
    config: Arc<ManagerConfig>,
    local_port: u16,
) -> (watch::Sender<ConnectivityState>, watch::Receiver<ConnectivityState>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(ConnectivityState::default());
    let task_tx = tx.clone();
    let handle = tokio::spawn(
        run(config, local_port, task_tx).instrument(tracing::info_span!("connectivity_probe")),
    );
    (tx, rx, handle)
}

async fn run(config: Arc<ManagerConfig>, local_port: u16, tx: watch::Sender<ConnectivityState>) {
    sleep(config.probe_initial_delay).await;

    let client = reqwest::Client::new();

    loop {
        let previous = *tx.borrow();
        let previous_pair = (previous.internet_status, previous.upnp_status);

        let mut state = previous;
        classify_interface(&mut state, local_port, &config).await;

        if (state.internet_status, state.upnp_status) != previous_pair {
            validate(&mut state, &client, &config, local_port).await;
        }

        tracing::info!(?state, "connectivity probe tick");
        if state != previous {
            let _ = tx.send(state);
        }

        let interval = if state.is_healthy() {
            config.probe_normal_interval
        } else {
            config.probe_error_interval
        };
        sleep(interval).await;
    }
}

/// Step 1-4 of the probe (spec §4.6): classify the default interface, and for a private address,
/// discover a gateway and attempt a port mapping.
async fn classify_interface(state: &mut ConnectivityState, local_port: u16, config: &ManagerConfig) {
    match iface::default_ipv4() {
        LocalInterface::None => {
            state.internet_status = InternetConnectivityStatus::NoInternetConnection;
            state.upnp_status = UPnPDeviceStatus::Unknown;
            state.local_live_ip = None;
            state.upnp_external_ip = None;
            state.upnp_external_port = None;
        }
        LocalInterface::Public(ip) => {
            state.internet_status = InternetConnectivityStatus::DirectInternetConnection;
            state.upnp_status = UPnPDeviceStatus::Unknown;
            state.local_live_ip = Some(ip);
            state.upnp_external_ip = None;
            state.upnp_external_port = None;
        }
        LocalInterface::Private(ip) => {
            state.local_live_ip = Some(ip);
            match upnp::discover_and_map(
                ip,
                local_port,
                config.upnp_discover_timeout,
                &config.upnp_mapping_description,
            )
            .await
            {
                Ok(mapped) => {
                    state.internet_status = InternetConnectivityStatus::NatInternetConnectionViaUPnPRouter;
                    state.upnp_status = UPnPDeviceStatus::PortForwarded;
                    state.upnp_external_ip = Some(mapped.external_ip);
                    state.upnp_external_port = Some(mapped.external_port);
                }
                Err(upnp::UpnpError::DeviceNotFound) => {
                    tracing::debug!("no UPnP gateway found");
                    state.internet_status = InternetConnectivityStatus::NatInternetConnection;
                    state.upnp_status = UPnPDeviceStatus::DeviceNotFound;
                    state.upnp_external_ip = None;
                    state.upnp_external_port = None;
                }
                Err(upnp::UpnpError::ExternalIpPrivate) => {
                    state.internet_status = InternetConnectivityStatus::NatInternetConnection;
                    state.upnp_status = UPnPDeviceStatus::ExternalIpPrivate;
                    state.upnp_external_ip = None;
                    state.upnp_external_port = None;
                }
                Err(upnp::UpnpError::PortForwardingFailed) => {
                    tracing::debug!("UPnP port mapping failed");
                    state.internet_status = InternetConnectivityStatus::NatInternetConnection;
                    state.upnp_status = UPnPDeviceStatus::PortForwardingFailed;
                    state.upnp_external_ip = None;
                    state.upnp_external_port = None;
                }
            }
        }
    }
}

/// Step 5 of the probe (spec §4.6, §4.7): only runs when the status pair just changed. Confirms
/// reachability with the echo-check service and demotes on failure.
async fn validate(
    state: &mut ConnectivityState,
    client: &reqwest::Client,
    config: &ManagerConfig,
    local_port: u16,
) {
    let has_web_access =
        echo::check_web_access(client, &config.echo_service_url, config.echo_check_timeout).await;
    if !has_web_access {
        tracing::debug!("no general web access, demoting to no-internet-connection");
        state.internet_status = InternetConnectivityStatus::NoInternetConnection;
        state.upnp_status = UPnPDeviceStatus::Unknown;
        state.local_live_ip = None;
        state.upnp_external_ip = None;
        state.upnp_external_port = None;
        state.web_check_success = false;
        state.web_check_error = true;
        state.web_check_external_endpoint = None;
        state.received_live_inbound = false;
        return;
    }

    match state.internet_status {
        InternetConnectivityStatus::DirectInternetConnection => {
            match echo::check(client, &config.echo_service_url, local_port, config.echo_check_timeout).await
            {
                Ok(resp) if resp.success => {
                    state.web_check_success = true;
                    state.web_check_error = false;
                    state.web_check_external_endpoint = resp.endpoint;
                }
                Ok(_) => {
                    tracing::debug!("echo-check reports direct connection unreachable");
                    state.web_check_success = false;
                    state.web_check_error = true;
                    state.web_check_external_endpoint = None;
                    state.local_live_ip = None;
                    state.received_live_inbound = false;
                }
                Err(err) => {
                    tracing::debug!(%err, "echo-check request failed");
                    state.web_check_error = true;
                }
            }
        }
        InternetConnectivityStatus::NatInternetConnection => {
            // Informational only: no forwarded port exists to demote.
            match echo::check(client, &config.echo_service_url, local_port, config.echo_check_timeout).await
            {
                Ok(resp) => {
                    state.web_check_success = resp.success;
                    state.web_check_error = !resp.success;
                    state.web_check_external_endpoint = resp.endpoint;
                    if !resp.success {
                        state.received_live_inbound = false;
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "echo-check request failed");
                    state.web_check_error = true;
                }
            }
        }
        InternetConnectivityStatus::NatInternetConnectionViaUPnPRouter
            if state.upnp_status == UPnPDeviceStatus::PortForwarded =>
        {
            let external_port = state.upnp_external_port.unwrap_or(local_port);
            match echo::check(client, &config.echo_service_url, external_port, config.echo_check_timeout)
                .await
            {
                Ok(resp) if resp.success => {
                    state.web_check_success = true;
                    state.web_check_error = false;
                    state.web_check_external_endpoint = resp.endpoint;
                }
                Ok(_) => {
                    tracing::debug!("echo-check reports UPnP-forwarded port unreachable");
                    state.web_check_success = false;
                    state.web_check_error = true;
                    state.web_check_external_endpoint = None;
                    state.upnp_status = UPnPDeviceStatus::PortForwardedNotAccessible;
                    state.received_live_inbound = false;
                }
                Err(err) => {
                    tracing::debug!(%err, "echo-check request failed");
                    state.web_check_error = true;
                }
            }
        }
        _ => {
            state.web_check_success = false;
            state.web_check_error = true;
            state.web_check_external_endpoint = None;
        }
    }
}
