//! Key exchange pipeline
//!
//! Builds the build-request message for a path: one worker-pool job per
//! hop, chained, each generating that hop's ephemeral commitment keypair,
//! running the client half of the DH against the hop's long-term key,
//! deriving the nonce-mixing value, and sealing the hop's commit record
//! into its frame. The unused trailing frames were randomized up front, so
//! the finished message always carries the full frame count.
//!
//! Failures (DH, encode) abort the whole build before any network
//! activity: the completion callback fires on the logic queue with `None`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::{self, NonceXor};
use crate::error::{Result, VeilError};
use crate::frame::{SealedFrame, COMMIT_FRAME_SIZE};
use crate::messages::commit::{BuildRequest, CommitRecord};
use crate::path::Path;
use crate::runtime::{Logic, WorkerPool};
use crate::DEFAULT_LIFETIME_MS;

/// Completion callback: the finished request, or `None` if the build
/// aborted locally. Always invoked from the logic queue.
pub type PipelineCallback = Box<dyn FnOnce(Option<BuildRequest>) + Send>;

struct KeyExchangeChain {
    path: Arc<Mutex<Path>>,
    request: BuildRequest,
    idx: usize,
    workers: WorkerPool,
    logic: Logic,
    on_done: Option<PipelineCallback>,
}

/// Derive keys and assemble the build request for `path`, asynchronously.
///
/// Each hop's work runs as one worker-pool job; independent pipelines run
/// fully in parallel. The caller's callback must check its own stopped
/// flag: a builder that stopped mid-exchange discards the result there.
pub fn start_key_exchange(
    path: Arc<Mutex<Path>>,
    workers: WorkerPool,
    logic: Logic,
    on_done: impl FnOnce(Option<BuildRequest>) + Send + 'static,
) {
    let chain = Box::new(KeyExchangeChain {
        path,
        request: BuildRequest::randomized(),
        idx: 0,
        workers: workers.clone(),
        logic,
        on_done: Some(Box::new(on_done)),
    });
    workers.submit(move || step(chain));
}

/// One hop's worth of work; reschedules itself for the next hop
fn step(mut chain: Box<KeyExchangeChain>) {
    match process_hop(&mut chain) {
        Err(err) => {
            log::error!("key exchange failed at hop {}: {err}", chain.idx);
            finish(chain, false);
        }
        Ok(more) => {
            if more {
                let workers = chain.workers.clone();
                workers.submit(move || step(chain));
            } else {
                finish(chain, true);
            }
        }
    }
}

fn finish(mut chain: Box<KeyExchangeChain>, ok: bool) {
    let Some(on_done) = chain.on_done.take() else {
        return;
    };
    let request = ok.then(|| std::mem::replace(&mut chain.request, BuildRequest::randomized()));
    chain.logic.call(move || on_done(request));
}

/// Returns whether more hops remain
fn process_hop(chain: &mut KeyExchangeChain) -> Result<bool> {
    let idx = chain.idx;
    let mut path = chain.path.lock();
    let hop_count = path.hops.len();
    if idx >= hop_count {
        return Err(VeilError::Internal("pipeline ran past last hop".into()));
    }
    // the record for hop i carries hop i+1's full contact so it can reach
    // a router it has never talked to
    let next_rc = if idx + 1 < hop_count {
        Some(path.hops[idx + 1].rc.clone())
    } else {
        None
    };

    let hop = &mut path.hops[idx];
    let (commit_secret, commit_public) = crypto::keygen();
    let shared = crypto::dh_client(&commit_secret, &hop.rc.enc_key, &hop.tunnel_nonce)?;
    hop.nonce_xor = NonceXor::derive(&shared);
    hop.shared = Some(shared);
    hop.commit_secret = Some(commit_secret);

    let record = CommitRecord {
        commit_key: commit_public,
        tx_id: hop.tx_id,
        rx_id: hop.rx_id,
        tunnel_nonce: hop.tunnel_nonce,
        next_hop: hop.upstream,
        next_rc,
        work: None,
        lifetime_override_ms: (hop.lifetime_ms != DEFAULT_LIFETIME_MS).then_some(hop.lifetime_ms),
    };
    let frame = SealedFrame::seal_dh(&record.encode(), &hop.rc.enc_key, COMMIT_FRAME_SIZE)?;
    chain.request.frames[idx] = frame;

    chain.idx += 1;
    Ok(chain.idx < hop_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::{identity_keygen, RouterContact};
    use crate::path::ROLE_ANY;
    use crate::MAX_HOPS;
    use x25519_dalek::StaticSecret;

    fn router() -> (StaticSecret, RouterContact) {
        let identity = identity_keygen();
        let (enc_secret, enc_pub) = crypto::keygen();
        let rc = RouterContact::new_signed(
            &identity,
            enc_pub,
            "192.0.2.5:7100".parse().unwrap(),
            u64::MAX,
        );
        (enc_secret, rc)
    }

    fn run_pipeline(path: &Arc<Mutex<Path>>) -> Option<BuildRequest> {
        let logic = Logic::new();
        let result: Arc<Mutex<Option<Option<BuildRequest>>>> = Arc::new(Mutex::new(None));
        let slot = result.clone();
        start_key_exchange(
            path.clone(),
            WorkerPool::inline(),
            logic.clone(),
            move |req| {
                *slot.lock() = Some(req);
            },
        );
        logic.drain();
        let out = result.lock().take().expect("pipeline must complete");
        out
    }

    #[test]
    fn test_pipeline_fills_every_hop() {
        let routers: Vec<_> = (0..3).map(|_| router()).collect();
        let contacts = routers.iter().map(|(_, rc)| rc.clone()).collect();
        let path = Arc::new(Mutex::new(
            Path::new(contacts, ROLE_ANY, "[pipe]".into(), 0).unwrap(),
        ));

        let request = run_pipeline(&path).expect("pipeline should succeed");
        assert_eq!(request.frames.len(), MAX_HOPS);

        let p = path.lock();
        for hop in &p.hops {
            assert!(hop.shared.is_some());
            assert!(hop.commit_secret.is_some());
            assert_ne!(hop.nonce_xor, NonceXor::default());
        }
    }

    #[test]
    fn test_frames_open_for_their_hops_only() {
        let routers: Vec<_> = (0..3).map(|_| router()).collect();
        let contacts: Vec<_> = routers.iter().map(|(_, rc)| rc.clone()).collect();
        let path = Arc::new(Mutex::new(
            Path::new(contacts, ROLE_ANY, "[pipe]".into(), 0).unwrap(),
        ));
        let request = run_pipeline(&path).unwrap();
        let p = path.lock();

        for (i, (enc_secret, rc)) in routers.iter().enumerate() {
            let body = request.frames[i].open_dh(enc_secret).unwrap();
            let record = CommitRecord::decode(&body).unwrap();
            assert_eq!(record.tx_id, p.hops[i].tx_id);
            assert_eq!(record.rx_id, p.hops[i].rx_id);
            if i + 1 < routers.len() {
                assert_eq!(record.next_hop, routers[i + 1].1.router_id);
                assert_eq!(
                    record.next_rc.as_ref().map(|rc| rc.router_id),
                    Some(routers[i + 1].1.router_id)
                );
            } else {
                // last hop forwards to itself and carries no contact
                assert_eq!(record.next_hop, rc.router_id);
                assert!(record.next_rc.is_none());
            }
            // other hops cannot open this frame
            for (j, (other_secret, _)) in routers.iter().enumerate() {
                if i != j {
                    assert!(request.frames[i].open_dh(other_secret).is_err());
                }
            }
        }

        // trailing frames are noise to everyone
        for frame in &request.frames[3..] {
            for (enc_secret, _) in &routers {
                assert!(frame.open_dh(enc_secret).is_err());
            }
        }
    }

    #[test]
    fn test_hop_keys_match_server_side() {
        let routers: Vec<_> = (0..2).map(|_| router()).collect();
        let contacts: Vec<_> = routers.iter().map(|(_, rc)| rc.clone()).collect();
        let path = Arc::new(Mutex::new(
            Path::new(contacts, ROLE_ANY, "[pipe]".into(), 0).unwrap(),
        ));
        let request = run_pipeline(&path).unwrap();
        let p = path.lock();

        for (i, (enc_secret, _)) in routers.iter().enumerate() {
            let body = request.frames[i].open_dh(enc_secret).unwrap();
            let record = CommitRecord::decode(&body).unwrap();
            let server_key =
                crypto::dh_server(enc_secret, &record.commit_key, &record.tunnel_nonce).unwrap();
            assert_eq!(&server_key, p.hops[i].shared.as_ref().unwrap());
        }
    }
}
