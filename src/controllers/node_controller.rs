//! Node registration and heartbeat
//!
//! Every tick renews the node lease in `kube-node-lease` and pushes a fresh
//! node status. When the control plane does not serve leases, or leases are
//! disabled, the status update alone keeps the node alive.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Node;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::node_builder;
use crate::controllers::Context;
use crate::metrics::{NODE_HEARTBEATS, NODE_LEASE_RENEWALS};
use crate::Result;

/// Create the virtual node. A node that already exists counts as registered.
#[instrument(skip(ctx), fields(node = %ctx.config.node_name))]
pub async fn register(ctx: &Context) -> Result<()> {
    let node = node_builder::build_node(&ctx.config, ctx.provider.as_ref());
    match ctx.control_plane.create_node(&node).await {
        Ok(_) => {
            info!("Registered node");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!("Node already registered");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Refresh the node status from the provider, registering the node again if it is gone
pub async fn heartbeat(ctx: &Context) -> Result<Node> {
    let Some(mut node) = ctx.control_plane.get_node(&ctx.config.node_name).await? else {
        info!(node = %ctx.config.node_name, "Node missing, registering again");
        register(ctx).await?;
        return ctx
            .control_plane
            .get_node(&ctx.config.node_name)
            .await?
            .ok_or_else(|| crate::Error::NotFound(ctx.config.node_name.clone()));
    };

    node_builder::refresh_status(&mut node, &ctx.config, ctx.provider.as_ref());
    ctx.control_plane.update_node_status(&node).await
}

/// Create the node lease, replacing a stale one left by a previous holder.
/// `Ok(None)` means the control plane does not serve leases.
#[instrument(skip(ctx), fields(node = %ctx.config.node_name))]
pub async fn ensure_lease(ctx: &Context) -> Result<Option<Lease>> {
    let lease = node_builder::build_lease(&ctx.config, Utc::now());
    match ctx.control_plane.create_lease(&lease).await {
        Ok(created) => {
            info!("Created node lease");
            Ok(Some(created))
        }
        Err(e) if e.is_not_found() => {
            warn!("Node leases are not served, heartbeating through node status only");
            Ok(None)
        }
        Err(e) if e.is_already_exists() => {
            debug!("Replacing existing node lease");
            if let Err(e) = ctx.control_plane.delete_lease(&ctx.config.node_name).await {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
            Ok(Some(ctx.control_plane.create_lease(&lease).await?))
        }
        Err(e) => Err(e),
    }
}

/// Renew the node lease, creating it again when it is gone.
/// `Ok(None)` means the control plane does not serve leases.
pub async fn renew_lease(ctx: &Context) -> Result<Option<Lease>> {
    let lease = node_builder::build_lease(&ctx.config, Utc::now());
    match ctx.control_plane.renew_lease(&lease).await {
        Ok(renewed) => Ok(Some(renewed)),
        Err(e) if e.is_not_found() => {
            info!(node = %ctx.config.node_name, "Node lease missing, creating it again");
            ensure_lease(ctx).await
        }
        Err(e) => Err(e),
    }
}

/// Renew the lease if leases are in use. Clears `leases` once the control
/// plane turns out not to serve them.
async fn ping_lease(ctx: &Context, leases: &mut bool) {
    if !*leases {
        return;
    }
    match renew_lease(ctx).await {
        Ok(Some(_)) => {
            NODE_LEASE_RENEWALS.with_label_values(&["success"]).inc();
        }
        Ok(None) => *leases = false,
        Err(e) => {
            NODE_LEASE_RENEWALS.with_label_values(&["error"]).inc();
            error!(node = %ctx.config.node_name, error = %e, "Node lease renewal failed");
        }
    }
}

/// Register the node and keep its lease and status fresh until the root
/// token is cancelled. Failures are logged and retried on the next tick.
pub async fn run(ctx: Arc<Context>) {
    if let Err(e) = register(&ctx).await {
        error!(error = %e, "Failed to register node");
    }

    let mut leases = !ctx.config.disable_lease;
    if leases {
        match ensure_lease(&ctx).await {
            Ok(lease) => leases = lease.is_some(),
            Err(e) => error!(error = %e, "Failed to create node lease"),
        }
    }

    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        ping_lease(&ctx, &mut leases).await;
        match heartbeat(&ctx).await {
            Ok(_) => {
                NODE_HEARTBEATS.with_label_values(&["success"]).inc();
            }
            Err(e) => {
                NODE_HEARTBEATS.with_label_values(&["error"]).inc();
                error!(node = %ctx.config.node_name, error = %e, "Node heartbeat failed");
            }
        }
    }

    info!("Node controller stopped");
}
