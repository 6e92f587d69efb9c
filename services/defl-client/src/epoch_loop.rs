//! The per-epoch state machine: fetch → aggregate → train → submit →
//! vote.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use defl_aggregate::{AggregateError, Aggregator, AggregatorKind, Weights};
use defl_model::{ModelError, ModelRuntime, Poisoner};
use thiserror::Error;

use crate::committer::{Committer, ObservationQueue};

/// Only shape mismatches and model/poisoner failures are fatal here;
/// everything else (connection errors, staleness, empty bundles, missed
/// responses) is handled inline by `run_iteration` and never escapes as
/// an error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("aggregator error: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("model runtime error: {0}")]
    Model(#[from] ModelError),
}

pub struct EpochLoopParams {
    pub fetch_timeout: Duration,
    pub gst_timeout: Duration,
    pub save_freq: u64,
    pub local_train_steps: u32,
    pub num_byzantine: usize,
}

pub struct EpochLoop<M: ModelRuntime> {
    committer: Arc<Committer>,
    queue: ObservationQueue,
    aggregator: Aggregator,
    model: M,
    poisoner: Box<dyn Poisoner>,
    init_weights: Weights,
    checkpoint_path: Option<PathBuf>,
    params: EpochLoopParams,
    epoch_id: i64,
    round: u64,
}

impl<M: ModelRuntime> EpochLoop<M> {
    pub fn new(
        committer: Arc<Committer>,
        queue: ObservationQueue,
        aggregator_kind: AggregatorKind,
        model: M,
        poisoner: Box<dyn Poisoner>,
        checkpoint_path: Option<PathBuf>,
        params: EpochLoopParams,
    ) -> Self {
        let init_weights = model.get_weights();
        Self {
            committer,
            queue,
            aggregator: Aggregator::new(aggregator_kind),
            model,
            poisoner,
            init_weights,
            checkpoint_path,
            params,
            epoch_id: -1,
            round: 0,
        }
    }

    pub fn epoch_id(&self) -> i64 {
        self.epoch_id
    }

    /// Run the state machine forever, one round per call to
    /// `run_iteration`. Only a [`ClientError`] (a configuration or model
    /// runtime fault) stops the loop; every other failure mode is logged
    /// and the loop continues.
    pub async fn run(&mut self) -> Result<(), ClientError> {
        loop {
            self.run_iteration().await?;
        }
    }

    /// One pass through `INIT -> WAIT_FETCH -> AGGREGATE -> TRAIN ->
    /// SUBMIT -> GST_WAIT -> VOTE`. Returns `Ok(())` whether or not the
    /// round actually advanced `epoch_id` — non-advancement (staleness,
    /// a missed response, a connection hiccup) is normal operation, not
    /// an error.
    ///
    /// The whole iteration is wrapped in a `2.5 * gst_timeout` deadlock
    /// guard: if anything in fetch/submit/vote stalls — including a vote
    /// `Response` that never arrives — the guard fires, `clear_session`
    /// reconnects, and the round is abandoned without advancing
    /// `epoch_id`.
    pub async fn run_iteration(&mut self) -> Result<(), ClientError> {
        let outer_timeout = self.params.gst_timeout.mul_f64(2.5);
        match tokio::time::timeout(outer_timeout, self.run_iteration_inner()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("deadlock guard fired: iteration exceeded 2.5x GST, clearing session");
                self.committer.clear_session().await;
                Ok(())
            }
        }
    }

    async fn run_iteration_inner(&mut self) -> Result<(), ClientError> {
        let Some(response) = self.wait_for_bundle().await else {
            return Ok(());
        };

        // Staleness check: never regress.
        if self.epoch_id > response.r_last_epoch_id as i64 {
            tracing::warn!(
                local_epoch_id = self.epoch_id,
                remote_epoch_id = response.r_last_epoch_id,
                "remote epoch id is not ahead of local epoch id, ignoring"
            );
            return Ok(());
        }

        let gst_deadline = tokio::time::Instant::now() + self.params.gst_timeout;

        self.aggregate(&response.w_last)?;

        // Evaluation is skipped in the bootstrap iteration and is
        // otherwise out of scope (no external model runtime wired in).

        self.model
            .local_train(self.params.local_train_steps, self.poisoner.as_ref())?;

        let target_epoch_id = response.r_last_epoch_id + 1;
        let weights_bytes = self.model.serialized_weights()?;
        let Some(_update_resp) = self.committer.update_weights(target_epoch_id, weights_bytes).await
        else {
            tracing::warn!(target_epoch_id, "update_weights failed, retrying next round");
            return Ok(());
        };

        tokio::time::sleep_until(gst_deadline).await;

        match self.committer.new_epoch_vote(target_epoch_id).await {
            None => {
                tracing::warn!(target_epoch_id, "new_epoch_vote failed, retrying next round");
                return Ok(());
            }
            Some(vote_resp) if !vote_resp.is_vote_accepted() => {
                tracing::warn!(
                    target_epoch_id,
                    stat = vote_resp.stat,
                    "vote returned a non-accepted status"
                );
            }
            Some(_) => {}
        }

        self.epoch_id = target_epoch_id as i64;
        self.round += 1;
        self.maybe_checkpoint()?;
        Ok(())
    }

    /// Step 1: race a companion active-fetch (after `fetch_timeout`)
    /// against the passive observation queue's drain-latest. The deadlock
    /// guard around the whole iteration (including this step) is applied
    /// by the caller, `run_iteration`.
    async fn wait_for_bundle(&mut self) -> Option<defl_wire::WeightsResponse> {
        let companion = {
            let committer = self.committer.clone();
            let fetch_timeout = self.params.fetch_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(fetch_timeout).await;
                tracing::info!("fetch window elapsed with no passive push, issuing active fetch");
                committer.fetch_w_last().await;
            })
        };

        let result = self.queue.drain_latest().await;
        companion.abort();

        if result.is_none() {
            tracing::warn!("observation queue closed unexpectedly");
        }
        result
    }

    /// Step 4: empty bundle resets to the initial snapshot; otherwise
    /// feed every peer's weights into the aggregator and install the
    /// result. The aggregator buffer is always empty again on return,
    /// whether via `aggregate()` or because nothing was ever added.
    fn aggregate(&mut self, bundle: &std::collections::HashMap<String, Vec<u8>>) -> Result<(), ClientError> {
        if bundle.is_empty() {
            tracing::info!("empty peer bundle, resetting to initial snapshot");
            self.model.set_weights(self.init_weights.clone())?;
            return Ok(());
        }

        let mut names: Vec<&String> = bundle.keys().collect();
        names.sort();
        for name in names {
            let weights = self.model.decode_weights(&bundle[name])?;
            self.aggregator.add(&weights)?;
        }
        let aggregate = self.aggregator.aggregate(self.params.num_byzantine)?;
        self.model.set_weights(aggregate)?;
        Ok(())
    }

    fn maybe_checkpoint(&self) -> Result<(), ClientError> {
        if self.params.save_freq == 0 || self.round % self.params.save_freq != 0 {
            return Ok(());
        }
        let Some(path) = &self.checkpoint_path else {
            return Ok(());
        };
        tracing::info!(round = self.round, ?path, "writing checkpoint");
        self.model.checkpoint(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defl_model::{NoPoisoner, VecModel};
    use defl_wire::{ObsidoRequest, Response, WeightsResponse, response, ACK};
    use defl_codec::FrameCodec;
    use prost::Message;
    use tokio::net::{TcpListener, TcpStream};
    use uuid::Uuid;

    struct MockReplica {
        consensus_addr: std::net::SocketAddr,
        observer_addr: std::net::SocketAddr,
        consensus: TcpListener,
        observer: TcpListener,
    }

    async fn mock_replica() -> MockReplica {
        let consensus = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let observer = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        MockReplica {
            consensus_addr: consensus.local_addr().unwrap(),
            observer_addr: observer.local_addr().unwrap(),
            consensus,
            observer,
        }
    }

    fn w(values: &[f32]) -> Weights {
        vec![values.to_vec()]
    }

    #[tokio::test]
    async fn bootstrap_fetch_installs_init_snapshot_and_advances_epoch() {
        let replica = mock_replica().await;
        let c_addr = replica.consensus_addr;
        let o_addr = replica.observer_addr;

        let codec = FrameCodec::committer();
        let scripted = tokio::spawn(async move {
            let (mut obs_stream, _) = replica.observer.accept().await.unwrap();
            let register_bytes = codec.recv(&mut obs_stream).await.unwrap();
            let register = ObsidoRequest::decode(register_bytes.as_slice()).unwrap();
            let info = register.register_info.unwrap();
            codec.send(&mut obs_stream, ACK).await.unwrap();

            let passive_addr: std::net::SocketAddr =
                format!("{}:{}", info.pasv_host, info.pasv_port).parse().unwrap();
            let mut passive_conn = TcpStream::connect(passive_addr).await.unwrap();
            let push = WeightsResponse {
                response_uuid: Uuid::new_v4().to_string(),
                r_last_epoch_id: 0,
                w_last: Default::default(),
            };
            codec.send(&mut passive_conn, &push.encode_to_vec()).await.unwrap();

            let active_addr: std::net::SocketAddr =
                format!("{}:{}", info.host, info.port).parse().unwrap();

            let (mut consensus_stream, _) = replica.consensus.accept().await.unwrap();
            let mut active_conn: Option<TcpStream> = None;

            for expect_vote in [false, true] {
                let bytes = codec.recv(&mut consensus_stream).await.unwrap();
                let req = defl_wire::ClientRequest::decode(bytes.as_slice()).unwrap();
                codec.send(&mut consensus_stream, ACK).await.unwrap();
                if active_conn.is_none() {
                    active_conn = Some(TcpStream::connect(active_addr).await.unwrap());
                }
                let resp = Response {
                    request_uuid: req.request_uuid,
                    response_uuid: Uuid::new_v4().to_string(),
                    stat: response::Status::Ok as i32,
                    r_last_epoch_id: Some(if expect_vote { 1 } else { 0 }),
                };
                codec
                    .send(active_conn.as_mut().unwrap(), &resp.encode_to_vec())
                    .await
                    .unwrap();
            }
        });

        let (committer, queue) = Committer::bootstrap("alice", "127.0.0.1", c_addr.port(), o_addr.port())
            .await
            .unwrap();

        let model = VecModel::new(w(&[1.0, 2.0, 3.0]));
        let params = EpochLoopParams {
            fetch_timeout: Duration::from_secs(20),
            gst_timeout: Duration::from_millis(50),
            save_freq: 0,
            local_train_steps: 1,
            num_byzantine: 0,
        };
        let mut loop_ = EpochLoop::new(
            Arc::new(committer),
            queue,
            AggregatorKind::Mean,
            model,
            Box::new(NoPoisoner),
            None,
            params,
        );

        assert_eq!(loop_.epoch_id(), -1);
        loop_.run_iteration().await.unwrap();
        assert_eq!(loop_.epoch_id(), 1);

        scripted.await.unwrap();
    }

    #[tokio::test]
    async fn stale_push_does_not_advance_epoch() {
        let replica = mock_replica().await;
        let c_addr = replica.consensus_addr;
        let o_addr = replica.observer_addr;
        let codec = FrameCodec::committer();

        let scripted = tokio::spawn(async move {
            let (mut obs_stream, _) = replica.observer.accept().await.unwrap();
            let register_bytes = codec.recv(&mut obs_stream).await.unwrap();
            let register = ObsidoRequest::decode(register_bytes.as_slice()).unwrap();
            let info = register.register_info.unwrap();
            codec.send(&mut obs_stream, ACK).await.unwrap();

            let passive_addr: std::net::SocketAddr =
                format!("{}:{}", info.pasv_host, info.pasv_port).parse().unwrap();
            let mut passive_conn = TcpStream::connect(passive_addr).await.unwrap();
            let push = WeightsResponse {
                response_uuid: Uuid::new_v4().to_string(),
                r_last_epoch_id: 4,
                w_last: Default::default(),
            };
            codec.send(&mut passive_conn, &push.encode_to_vec()).await.unwrap();
            // No further traffic expected: the client must not submit or vote.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (committer, queue) = Committer::bootstrap("bob", "127.0.0.1", c_addr.port(), o_addr.port())
            .await
            .unwrap();
        let model = VecModel::new(w(&[1.0]));
        let params = EpochLoopParams {
            fetch_timeout: Duration::from_secs(20),
            gst_timeout: Duration::from_millis(50),
            save_freq: 0,
            local_train_steps: 1,
            num_byzantine: 0,
        };
        let mut loop_ = EpochLoop::new(
            Arc::new(committer),
            queue,
            AggregatorKind::Mean,
            model,
            Box::new(NoPoisoner),
            None,
            params,
        );
        // Force the local epoch id ahead of the incoming push.
        loop_.epoch_id = 5;
        loop_.run_iteration().await.unwrap();
        assert_eq!(loop_.epoch_id(), 5);

        scripted.abort();
    }

    #[tokio::test]
    async fn drain_latest_collapses_to_greatest_epoch_id() {
        let replica = mock_replica().await;
        let c_addr = replica.consensus_addr;
        let o_addr = replica.observer_addr;
        let codec = FrameCodec::committer();

        let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();
        let scripted = tokio::spawn(async move {
            let (mut obs_stream, _) = replica.observer.accept().await.unwrap();
            let register_bytes = codec.recv(&mut obs_stream).await.unwrap();
            let register = ObsidoRequest::decode(register_bytes.as_slice()).unwrap();
            let info = register.register_info.unwrap();
            codec.send(&mut obs_stream, ACK).await.unwrap();
            let _ = addr_tx.send(info.clone());

            let passive_addr: std::net::SocketAddr =
                format!("{}:{}", info.pasv_host, info.pasv_port).parse().unwrap();
            let mut passive_conn = TcpStream::connect(passive_addr).await.unwrap();
            for epoch in [3u64, 7, 5] {
                let push = WeightsResponse {
                    response_uuid: Uuid::new_v4().to_string(),
                    r_last_epoch_id: epoch,
                    w_last: Default::default(),
                };
                codec.send(&mut passive_conn, &push.encode_to_vec()).await.unwrap();
            }

            let active_addr: std::net::SocketAddr =
                format!("{}:{}", info.host, info.port).parse().unwrap();
            let (mut consensus_stream, _) = replica.consensus.accept().await.unwrap();
            let mut active_conn: Option<TcpStream> = None;
            for _ in 0..2 {
                let bytes = codec.recv(&mut consensus_stream).await.unwrap();
                let req = defl_wire::ClientRequest::decode(bytes.as_slice()).unwrap();
                codec.send(&mut consensus_stream, ACK).await.unwrap();
                if active_conn.is_none() {
                    active_conn = Some(TcpStream::connect(active_addr).await.unwrap());
                }
                let resp = Response {
                    request_uuid: req.request_uuid,
                    response_uuid: Uuid::new_v4().to_string(),
                    stat: response::Status::Ok as i32,
                    r_last_epoch_id: Some(8),
                };
                codec
                    .send(active_conn.as_mut().unwrap(), &resp.encode_to_vec())
                    .await
                    .unwrap();
            }
        });

        let (committer, mut queue) = Committer::bootstrap("carol", "127.0.0.1", c_addr.port(), o_addr.port())
            .await
            .unwrap();
        let _ = addr_rx.await;
        // Give the passive handler a moment to buffer all three pushes
        // before draining, so drain_latest sees them all at once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let drained = queue.drain_latest().await.unwrap();
        assert_eq!(drained.r_last_epoch_id, 7);

        drop(committer);
        scripted.abort();
    }
}
