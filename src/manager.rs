use crate::api::CrmApi;
use crate::auth::Session;
use crate::bus::{Event, EventBus};
use crate::cache::EntityCache;
use crate::config::Config;
use crate::error::SyncResult;
use crate::reconciler::Reconciler;
use crate::store::Store;
use crate::transport::rest::RestClient;
use crate::transport::socket::SocketClient;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns everything one signed-in client needs: store, bus, cache, the shared
/// socket and the API on top of them.
pub struct Manager {
    config: Config,
    bus: Arc<EventBus>,
    store: Store,
    cache: EntityCache,
    socket: Arc<SocketClient>,
    reconciler: Reconciler,
    rest: RestClient,
    session: Session,
    api: CrmApi,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Open the persisted store at `config.db_path` and build the context.
    pub async fn init(config: Config) -> SyncResult<Self> {
        info!("Initializing store at {}", config.db_path.display());
        let store = Store::open(&config.db_path).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Store) -> SyncResult<Self> {
        let bus = Arc::new(EventBus::new());
        let cache = EntityCache::new(config.cache_grace);
        let socket = Arc::new(SocketClient::new(&config, bus.clone()));
        let reconciler = Reconciler::new(socket.clone(), cache.clone());
        let rest = RestClient::new(&config, store.clone(), bus.clone())?;
        let session = Session::new(rest.clone(), store.clone());
        let api = CrmApi::new(rest.clone(), cache.clone(), reconciler.clone());

        Ok(Self {
            config,
            bus,
            store,
            cache,
            socket,
            reconciler,
            rest,
            session,
            api,
            watcher: Mutex::new(None),
        })
    }

    /// Connect the socket and start reacting to forced logouts.
    pub fn start(&self) {
        info!("Connecting to {}", self.socket.endpoint());
        self.socket.start();

        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let mut events = self.bus.subscribe();
        let cache = self.cache.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::ForcedLogout { reason }) => {
                        info!("Session ended ({}), dropping cached data", reason);
                        cache.clear();
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Session watcher skipped {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Session watcher stopped");
        }));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn socket(&self) -> &Arc<SocketClient> {
        &self.socket
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn api(&self) -> &CrmApi {
        &self.api
    }

    /// Log out and drop everything cached for the old user.
    pub async fn logout(&self) -> SyncResult<()> {
        self.session.logout().await?;
        self.cache.clear();
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down...");
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.cache.clear();
        self.reconciler.detach_all();
        self.socket.shutdown().await;
    }
}
