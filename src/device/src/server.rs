use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use secomm::{ChannelListener, ChannelMux, SecAssociation, SecureChannel};
use tracing::{debug, info, trace, warn};
use wire::DeviceCmd;

use crate::{Block, DeviceError, MappedStorage};

const LISTENER_TOKEN: u64 = u64::MAX;
/// Poll granularity; bounds how long a pending shutdown flag goes unobserved.
const POLL_MS: u16 = 250;

/// Everything a daemon needs to serve one device entry.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub device_id: u32,
    /// The only peer identity accepted in request headers.
    pub user_id: u64,
    pub backing_path: PathBuf,
    pub num_blocks: u64,
    pub listen_port: u16,
    pub sa_initiator: String,
    pub sa_responder: String,
    pub sa_key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Ready,
    Errored,
}

/// The storage daemon: owns the mapped backing image and services the block
/// protocol over a poll-multiplexed set of sessions.
///
/// Protocol violations close the offending session and nothing else; poll or
/// storage failures transition to `Errored` and shut the daemon down.
pub struct DeviceServer {
    cfg: DaemonConfig,
    storage: MappedStorage,
    listener: ChannelListener,
    state: ServerState,
    shutdown: Arc<AtomicBool>,
}

impl DeviceServer {
    pub fn new(cfg: DaemonConfig, shutdown: Arc<AtomicBool>) -> Result<Self, DeviceError> {
        let storage = MappedStorage::open(&cfg.backing_path, cfg.num_blocks)?;
        let listener = ChannelListener::bind(cfg.listen_port)?;
        Ok(Self { cfg, storage, listener, state: ServerState::Uninitialized, shutdown })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The bound port; differs from the configured one when it was 0.
    pub fn local_port(&self) -> Result<u16, DeviceError> {
        Ok(self.listener.local_port()?)
    }

    /// Serve until the shutdown flag is raised.
    pub fn run(&mut self) -> Result<(), DeviceError> {
        self.state = ServerState::Ready;
        info!(
            did = self.cfg.device_id,
            port = self.local_port()?,
            blocks = self.cfg.num_blocks,
            "device server ready"
        );

        let mut sessions: HashMap<u64, SecureChannel> = HashMap::new();
        let mut next_token = 0u64;
        let mut served = 0u64;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(
                    did = self.cfg.device_id,
                    served,
                    sessions = next_token,
                    "shutdown requested, draining"
                );
                break;
            }

            let mut mux = ChannelMux::new();
            mux.register(LISTENER_TOKEN, &self.listener);
            for (tok, chan) in &sessions {
                mux.register(*tok, chan);
            }
            let ready = match mux.wait(POLL_MS) {
                Ok(ready) => ready,
                Err(e) => {
                    self.state = ServerState::Errored;
                    return Err(e.into());
                }
            };

            let mut closed = Vec::new();
            for tok in ready {
                if tok == LISTENER_TOKEN {
                    match self.accept_session() {
                        Ok(chan) => {
                            sessions.insert(next_token, chan);
                            next_token += 1;
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                    continue;
                }
                let Some(chan) = sessions.get(&tok) else { continue };
                match self.serve_one(chan) {
                    Ok(()) => served += 1,
                    Err(e) => {
                        warn!(error = %e, peer = %chan.peer_addr(), "closing session");
                        chan.shutdown();
                        closed.push(tok);
                    }
                }
            }
            for tok in closed {
                sessions.remove(&tok);
            }
        }
        Ok(())
    }

    fn accept_session(&self) -> Result<SecureChannel, DeviceError> {
        // fresh per-connection session: counters restart at zero, the key is
        // the long-lived one from configuration
        let sa = SecAssociation::new(
            self.cfg.sa_initiator.clone(),
            self.cfg.sa_responder.clone(),
            &self.cfg.sa_key,
        )?;
        Ok(self.listener.accept(sa)?)
    }

    fn serve_one(&self, chan: &SecureChannel) -> Result<(), DeviceError> {
        let req = chan.recv()?;
        let (hdr, body) = wire::decode_packet(&req)?;
        if hdr.ack {
            return Err(DeviceError::Protocol("request with ack set"));
        }
        if hdr.device_id != self.cfg.device_id {
            return Err(DeviceError::Protocol("request for wrong device"));
        }
        if hdr.user_id != self.cfg.user_id {
            return Err(DeviceError::Protocol("request from unknown peer"));
        }
        trace!(cmd = hdr.cmd.name(), len = body.len(), "request");

        let resp_body = match hdr.cmd {
            DeviceCmd::GetTopo => {
                if !body.is_empty() {
                    return Err(DeviceError::Protocol("unexpected topo body"));
                }
                wire::encode_topo(self.cfg.device_id, self.cfg.num_blocks)
            }
            DeviceCmd::GetBlock => {
                let pbid = wire::decode_pbid(body)?;
                let mut blk = Block::zeroed();
                self.storage.read_block(pbid, blk.as_bytes_mut().as_mut_slice())?;
                wire::encode_block_with_id(blk.as_bytes(), pbid)
            }
            DeviceCmd::PutBlock => {
                let (data, pbid) = wire::decode_block_with_id(body)?;
                self.storage.write_block(pbid, data.as_slice())?;
                wire::encode_pbid(pbid)
            }
            DeviceCmd::GetBlocks => {
                let ids = wire::decode_id_list(body)?;
                let mut blocks = Vec::with_capacity(ids.len());
                for &pbid in &ids {
                    let mut blk = Block::zeroed();
                    self.storage.read_block(pbid, blk.as_bytes_mut().as_mut_slice())?;
                    blocks.push((pbid, blk));
                }
                let refs: Vec<(u64, &[u8; wire::BLOCK_SIZE])> =
                    blocks.iter().map(|(pbid, b)| (*pbid, b.as_bytes())).collect();
                wire::encode_block_list(&refs)
            }
            DeviceCmd::PutBlocks => {
                let blocks = wire::decode_block_list(body)?;
                for (pbid, data) in &blocks {
                    self.storage.write_block(*pbid, data)?;
                }
                let ids: Vec<u64> = blocks.iter().map(|(pbid, _)| *pbid).collect();
                wire::encode_id_list(&ids)
            }
        };

        chan.send(&wire::encode_packet(&hdr.response(), &resp_body))?;
        debug!(cmd = hdr.cmd.name(), "request served");
        Ok(())
    }
}
