//! Main application orchestration.
//!
//! Coordinates all components:
//! - Private stream session and subscriptions
//! - Order gateway (REST submission, `order` topic correlation)
//! - Account verification at startup
//! - Recurring market orders
//! - Metrics endpoint

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::metrics_server;
use bytrade_core::{OrderSpec, Signer, SystemClock, Topic};
use bytrade_executor::{
    BybitRestClient, JobHandle, OrderEvent, OrderGateway, RestClient, ScheduledOrderRunner,
};
use bytrade_ws::{Session, SubscriptionManager, TopicMessage, Transport, ORDER_TOPIC};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    transport: Arc<Transport>,
    session: Arc<Session>,
    subscriptions: Arc<SubscriptionManager>,
    rest: Arc<dyn RestClient>,
    gateway: OrderGateway,
    runner: ScheduledOrderRunner,
    shutdown_token: CancellationToken,
}

impl Application {
    /// Create the application with credentials from the environment.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let signer = Signer::new(config.credential()?)?;
        let rest: Arc<dyn RestClient> =
            Arc::new(BybitRestClient::new(config.rest_config(), signer.clone())?);
        Self::with_rest_client(config, signer, rest)
    }

    /// Create the application around an existing REST client.
    pub fn with_rest_client(
        config: AppConfig,
        signer: Signer,
        rest: Arc<dyn RestClient>,
    ) -> AppResult<Self> {
        let transport = Transport::new(config.transport_config());
        let session = Session::new(Arc::clone(&transport), signer, config.session_config());
        let subscriptions = SubscriptionManager::new(Arc::clone(&session));
        let gateway = OrderGateway::new(
            Arc::clone(&rest),
            config.gateway_config(),
            Arc::new(SystemClock),
        );

        let app = Self {
            config,
            transport,
            session,
            subscriptions,
            rest,
            gateway,
            runner: ScheduledOrderRunner::new(),
            shutdown_token: CancellationToken::new(),
        };
        app.wire()?;
        Ok(app)
    }

    pub fn gateway(&self) -> &OrderGateway {
        &self.gateway
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn runner(&self) -> &ScheduledOrderRunner {
        &self.runner
    }

    fn wire(&self) -> AppResult<()> {
        // Private order stream -> gateway
        let gateway = self.gateway.clone();
        self.subscriptions.on_topic(
            Topic::new(ORDER_TOPIC)?,
            Arc::new(move |msg: &TopicMessage| {
                let parsed = msg.order_updates();
                if parsed.failed_count > 0 {
                    warn!(failed = parsed.failed_count, "Unparseable order updates");
                }
                for update in &parsed.updates {
                    gateway.apply_order_update(update);
                }
            }),
        );

        // Stream events may have been missed while disconnected
        let gateway = self.gateway.clone();
        self.session.on_authenticated(Arc::new(move || {
            if gateway.active_orders().is_empty() {
                return;
            }
            let gateway = gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.reconcile_open_orders(None).await {
                    warn!(error = %e, "Open order reconciliation failed");
                }
            });
        }));

        self.gateway.on_event(Arc::new(|event: &OrderEvent| match event {
            OrderEvent::Updated(order) if order.is_terminal() => info!(
                client_order_id = %order.client_order_id,
                symbol = %order.symbol,
                status = %order.status,
                filled = %order.filled_quantity,
                reason = order.reject_reason.as_deref().unwrap_or(""),
                "Order finished"
            ),
            OrderEvent::Updated(order) => debug!(
                client_order_id = %order.client_order_id,
                status = %order.status,
                "Order updated"
            ),
            OrderEvent::SubmitFailed {
                client_order_id,
                error,
            } => warn!(client_order_id = %client_order_id, error = %error, "Order submission failed"),
        }));

        Ok(())
    }

    /// Log the account UID and balances. Failures are logged, not fatal.
    pub async fn verify_account(&self) {
        match self.rest.get_api_key_info().await {
            Ok(info) => {
                info!(uid = info.user_id, note = %info.note, "API key verified");
                if info.read_only != 0 {
                    warn!("API key is read-only, orders will be rejected");
                }
            }
            Err(e) => error!(error = %e, "API key verification failed"),
        }

        match self
            .rest
            .get_wallet_balance(self.config.account_type.clone())
            .await
        {
            Ok(accounts) => {
                for account in &accounts {
                    info!(
                        account_type = %account.account_type,
                        total_equity = %account.total_equity,
                        "Wallet balance"
                    );
                    for coin in &account.coin {
                        info!(
                            coin = %coin.coin,
                            wallet_balance = %coin.wallet_balance,
                            locked = %coin.locked,
                            "Coin balance"
                        );
                    }
                }
            }
            Err(e) => error!(error = %e, "Failed to fetch wallet balance"),
        }
    }

    /// Schedule every configured recurring order.
    pub fn start_recurring_jobs(&self) -> AppResult<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(self.config.recurring.len());
        for job in &self.config.recurring {
            let gateway = self.gateway.clone();
            let spec = OrderSpec::market(job.symbol.clone(), job.side, job.quantity);
            let handle = self
                .runner
                .schedule(Duration::from_millis(job.interval_ms), move || {
                    let result = gateway.submit_order(spec.clone());
                    async move {
                        let client_order_id = result?;
                        debug!(client_order_id = %client_order_id, "Recurring order submitted");
                        Ok::<(), bytrade_executor::GatewayError>(())
                    }
                })?;
            info!(
                job_id = handle.id(),
                symbol = %job.symbol,
                side = %job.side,
                quantity = %job.quantity,
                interval_ms = job.interval_ms,
                "Recurring order scheduled"
            );
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Run until Ctrl-C or until the stream gives up reconnecting.
    pub async fn run(self) -> AppResult<()> {
        info!(
            rest_url = %self.config.rest_base_url(),
            ws_url = %self.config.stream_url(),
            testnet = self.config.testnet,
            "Starting application"
        );

        if self.config.metrics.enabled {
            let listener = metrics_server::bind(self.config.metrics.port).await?;
            let shutdown = self.shutdown_token.clone();
            tokio::spawn(async move {
                if let Err(e) = metrics_server::serve(listener, shutdown).await {
                    error!(error = %e, "Metrics server failed");
                }
            });
        }

        let topics = self.config.subscription_topics()?;
        info!(topics = ?topics.iter().map(Topic::as_str).collect::<Vec<_>>(), "Configured subscriptions");
        self.subscriptions.subscribe(topics);

        let startup = async {
            self.session.connect().await?;
            if let Err(e) = self.session.await_authenticated().await {
                // The transport keeps reconnecting and re-authenticating
                error!(error = %e, "Initial authentication failed");
            }
            Ok::<(), AppError>(())
        };
        tokio::select! {
            result = startup => result?,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received during startup");
                self.shutdown().await;
                return Ok(());
            }
        }

        self.verify_account().await;
        self.start_recurring_jobs()?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received");
            }
            () = self.transport.stopped() => {
                warn!("Stream stopped reconnecting");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Cancel recurring jobs, stop the metrics endpoint and close the stream.
    pub async fn shutdown(&self) {
        self.runner.cancel_all();
        self.shutdown_token.cancel();
        self.session.close().await;
        info!(
            active_orders = self.gateway.active_orders().len(),
            health = ?self.subscriptions.health(),
            "Shutdown complete"
        );
    }
}
