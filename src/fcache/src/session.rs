use std::sync::Arc;

use bfs_config::ClientLayerConfig;
use secomm::SecAssociation;
use tracing::info;

use crate::{CachePolicy, FcacheError, FileCache, RpcFileServer};

/// A client's standing connection to the file server: the RPC channel plus
/// the local write-back cache in front of it. This is the surface the FUSE
/// bridge drives.
pub struct ClientSession {
    server: Arc<RpcFileServer>,
    cache: FileCache,
}

impl ClientSession {
    /// Connect, run `INIT` (or `INIT_MKFS` when configured) and set up the
    /// local cache.
    pub fn connect(cfg: &ClientLayerConfig) -> Result<Self, FcacheError> {
        let key = cfg.cl_serv_sa.key()?;
        let sa = SecAssociation::new(
            cfg.cl_serv_sa.initiator.clone(),
            cfg.cl_serv_sa.responder.clone(),
            &key,
        )?;
        let server = Arc::new(RpcFileServer::connect(
            &cfg.bfs_server_ip,
            cfg.bfs_server_port,
            sa,
        )?);

        if cfg.do_mkfs {
            server.init_mkfs()?;
        } else {
            server.init()?;
        }

        let cache = FileCache::new(
            server.clone(),
            &cfg.cache_dir,
            cfg.direct_io,
            CachePolicy::default(),
        )?;

        info!(
            server = %cfg.bfs_server_ip,
            port = cfg.bfs_server_port,
            mkfs = cfg.do_mkfs,
            direct_io = cfg.direct_io,
            "client session established"
        );
        Ok(Self { server, cache })
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Direct access to the RPC surface for the operations that bypass the
    /// cache (directory ops, attributes, ...).
    pub fn server(&self) -> &RpcFileServer {
        &self.server
    }

    /// Stop the cache (all handles should be released by now) and send
    /// `DESTROY`.
    pub fn shutdown(self) -> Result<(), FcacheError> {
        let Self { server, cache } = self;
        drop(cache);
        server.destroy()
    }
}
