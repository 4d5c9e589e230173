//! Hub wiring: listener + router + override feed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use weft_config::{ChangeEvent, ConfigStore};

use crate::auth::TokenValidator;
use crate::error::HubResult;
use crate::listener::{HubConfig, accept_loop};
use crate::router::{HubRouter, RouterConfig, RouterMsg};

/// A running hub: listener and router tasks plus their control handles.
pub struct Hub {
    addr: SocketAddr,
    router_tx: mpsc::Sender<RouterMsg>,
    shutdown_tx: broadcast::Sender<()>,
    listener_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
    override_task: Option<JoinHandle<()>>,
}

impl Hub {
    /// Bind and start the hub.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::HubError`] if the listener cannot bind.
    pub async fn start(
        config: HubConfig,
        router_config: RouterConfig,
        validator: Arc<dyn TokenValidator>,
    ) -> HubResult<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Hub listening");

        let (router, router_tx) = HubRouter::new(router_config);
        let router_task = tokio::spawn(router.run());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener_task = tokio::spawn(accept_loop(
            listener,
            config,
            validator,
            router_tx.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            addr,
            router_tx,
            shutdown_tx,
            listener_task,
            router_task,
            override_task: None,
        })
    }

    /// The bound address (useful with a `:0` bind).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// A sender into the router inbox.
    #[must_use]
    pub fn router(&self) -> mpsc::Sender<RouterMsg> {
        self.router_tx.clone()
    }

    /// Feed tool overrides from a config store into the router.
    ///
    /// Pushes the current override set immediately and again on every
    /// `Reload` event from the store.
    pub fn attach_config_store(&mut self, store: Arc<ConfigStore>) {
        let router_tx = self.router_tx.clone();
        self.override_task = Some(tokio::spawn(async move {
            let mut changes = store.subscribe();
            let overrides = store.overrides().await;
            if router_tx
                .send(RouterMsg::OverridesChanged { overrides })
                .await
                .is_err()
            {
                return;
            }

            while let Some(event) = changes.recv().await {
                if event != ChangeEvent::Reload {
                    continue;
                }
                let overrides = store.overrides().await;
                if router_tx
                    .send(RouterMsg::OverridesChanged { overrides })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));
    }

    /// Stop the hub: listener first, then the router.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.override_task {
            task.abort();
        }
        let _ = self.router_tx.send(RouterMsg::Shutdown).await;

        if tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let _ = self.listener_task.await;
            let _ = self.router_task.await;
        })
        .await
        .is_err()
        {
            warn!("Hub tasks did not stop in time");
        }
    }
}
