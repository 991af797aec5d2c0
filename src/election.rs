//! Leader election gate (component L).
//!
//! Grounded on spec §4.L/§9 ("Leader election backing store, decided"): no
//! leader-election crate independent of a KV store exists in the surveyed
//! ecosystem, so this is backed by `etcd-client`'s own `ElectionClient`
//! (campaign/observe over a session lease) rather than introducing a second
//! coordination dependency. The observable itself is a `tokio::sync::watch`
//! channel, the same "cheap broadcast of a small piece of state" idiom the
//! teacher's `heartbeat.rs` uses for its own run-state flag.

use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, ElectionClient, LeaderKey};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 10s lease per §5's "Election timeout is 10 s lease".
const LEASE_TTL_SECS: i64 = 10;
const CAMPAIGN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Gate consulted by every master component: `i_am_leader()` is true only
/// while this process holds the election lease.
#[derive(Clone)]
pub struct ElectionCoord {
    leader: watch::Receiver<bool>,
}

impl ElectionCoord {
    pub fn i_am_leader(&self) -> bool {
        *self.leader.borrow()
    }

    pub async fn wait_for_leadership(&mut self) {
        loop {
            if *self.leader.borrow() {
                return;
            }
            if self.leader.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn wait_for_leadership_loss(&mut self) {
        loop {
            if !*self.leader.borrow() {
                return;
            }
            if self.leader.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawns the campaign loop: acquires a lease, campaigns on `election_name`
    /// with `candidate_id` as the advertised value, flips the observable to
    /// `true` once the campaign resolves, and keeps the lease alive with
    /// `ElectionClient::observe` until cancellation or lease loss, at which
    /// point it flips back to `false` and re-campaigns.
    pub fn spawn(
        client: Arc<tokio::sync::Mutex<Client>>,
        election_name: String,
        candidate_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match campaign_once(&client, &election_name, &candidate_id, &tx, &cancel).await {
                    Ok(()) => {}
                    Err(e) => warn!("election campaign error, retrying: {e}"),
                }

                let _ = tx.send(false);
                if cancel.is_cancelled() {
                    return;
                }
                tokio::time::sleep(CAMPAIGN_RETRY_DELAY).await;
            }
        });

        Self { leader: rx }
    }
}

async fn campaign_once(
    client: &Arc<tokio::sync::Mutex<Client>>,
    election_name: &str,
    candidate_id: &str,
    leader_flag: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut guard = client.lock().await;
    let lease = guard.lease_grant(LEASE_TTL_SECS, None).await?;
    let lease_id = lease.id();
    let mut election: ElectionClient = guard.election_client();
    drop(guard);

    info!("campaigning for leadership of {election_name} as {candidate_id}");
    let resp = tokio::select! {
        r = election.campaign(election_name, candidate_id, lease_id) => r?,
        _ = cancel.cancelled() => return Ok(()),
    };
    let leader_key: LeaderKey = resp
        .leader()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("campaign response carried no leader key"))?;

    info!("acquired leadership of {election_name}");
    let _ = leader_flag.send(true);

    // Keep the lease alive for as long as we hold leadership; if the observe
    // stream ends (lease expired, connection dropped, or we were cancelled)
    // leadership is lost and the outer loop re-campaigns.
    let (mut keeper, mut stream) = client.lock().await.lease_keep_alive(lease_id).await?;
    loop {
        tokio::select! {
            sent = keeper.keep_alive() => {
                if sent.is_err() {
                    warn!("lease keep-alive send failed for {election_name}");
                    break;
                }
            }
            resp = stream.message() => {
                match resp {
                    Ok(Some(r)) if r.ttl() > 0 => {}
                    _ => {
                        warn!("lease keep-alive stream ended for {election_name}");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(LEASE_TTL_SECS as u64 / 3)) => {}
            _ = cancel.cancelled() => {
                let _ = election.resign(leader_key).await;
                return Ok(());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observable_starts_false() {
        let (_tx, rx) = watch::channel(false);
        let coord = ElectionCoord { leader: rx };
        assert!(!coord.i_am_leader());
    }

    #[tokio::test]
    async fn wait_for_leadership_returns_once_flipped() {
        let (tx, rx) = watch::channel(false);
        let mut coord = ElectionCoord { leader: rx };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });
        coord.wait_for_leadership().await;
        assert!(coord.i_am_leader());
    }
}
