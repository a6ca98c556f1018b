//! Order gateway: REST submission and lifecycle tracking.
//!
//! Every order is keyed by its [`ClientOrderId`], which is sent as
//! `orderLinkId` and echoed back by the exchange. Status changes come from
//! two independent sources, the REST response and the private `order`
//! stream, and may arrive in either order:
//!
//! ```text
//! Pending -> Submitted -> Acknowledged -> PartiallyFilled -> Filled
//!    |           |             |                |
//!    +-----------+-------------+----------------+--> Cancelled / Rejected
//! ```
//!
//! Each order lives in a `DashMap` shard; all mutation happens under that
//! entry's write guard, so the REST task and the stream handler never lose
//! each other's updates. Terminal states are final.

use crate::error::{GatewayError, GatewayResult, RestResult};
use crate::rest::{CancelOrderRequest, Category, PlaceOrderRequest, RestClient};
use bytrade_core::{ClientOrderId, Clock, Order, OrderSpec, OrderStatus, Size};
use bytrade_telemetry::Metrics;
use bytrade_ws::OrderUpdate;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub category: Category,
    /// Delay before the single retry of a transient REST failure.
    pub retry_backoff: Duration,
    /// How long terminal orders stay queryable.
    pub retention: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            category: Category::Spot,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Notification emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    /// An order was created or changed; carries the new snapshot.
    Updated(Order),
    /// The REST submission failed; the order is now `Rejected`.
    SubmitFailed {
        client_order_id: ClientOrderId,
        error: GatewayError,
    },
}

pub type OrderEventHandler = Arc<dyn Fn(&OrderEvent) + Send + Sync>;

/// Submits orders and tracks them until they are terminal.
///
/// Cheap to clone; clones share the same order book.
#[derive(Clone)]
pub struct OrderGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    rest: Arc<dyn RestClient>,
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    orders: DashMap<ClientOrderId, Order>,
    by_exchange_id: DashMap<String, ClientOrderId>,
    handlers: RwLock<Vec<OrderEventHandler>>,
}

impl OrderGateway {
    pub fn new(rest: Arc<dyn RestClient>, config: GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                rest,
                config,
                clock,
                orders: DashMap::new(),
                by_exchange_id: DashMap::new(),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Register an observer. Handlers run in registration order on the
    /// task that caused the change.
    pub fn on_event(&self, handler: OrderEventHandler) {
        self.inner.handlers.write().push(handler);
    }

    /// Validate `spec`, start tracking it as `Pending` and submit it in the
    /// background.
    ///
    /// Returns as soon as the order is tracked; the outcome of the REST call
    /// arrives as [`OrderEvent`]s. Fails with [`GatewayError::NoRuntime`]
    /// outside a Tokio runtime, before anything is tracked.
    pub fn submit_order(&self, spec: OrderSpec) -> GatewayResult<ClientOrderId> {
        spec.validate()
            .map_err(|e| GatewayError::InvalidOrderSpec(e.to_string()))?;
        let runtime =
            Handle::try_current().map_err(|e| GatewayError::NoRuntime(e.to_string()))?;
        self.prune_terminal();

        let client_order_id = ClientOrderId::new();
        let order = Order::new(client_order_id.clone(), spec, self.inner.clock.now_ms());
        let request = PlaceOrderRequest::from_order(&order, self.inner.config.category);

        info!(
            client_order_id = %client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity,
            "Order created"
        );
        self.inner
            .orders
            .insert(client_order_id.clone(), order.clone());
        Metrics::order_transition(OrderStatus::Pending.as_str());
        self.inner.emit(&OrderEvent::Updated(order));

        let inner = Arc::clone(&self.inner);
        let id = client_order_id.clone();
        runtime.spawn(async move {
            inner.submit(id, request).await;
        });

        Ok(client_order_id)
    }

    /// Request cancellation of a live order.
    ///
    /// The resulting `Cancelled` state arrives through the order stream.
    pub async fn cancel_order(&self, client_order_id: &ClientOrderId) -> GatewayResult<()> {
        let symbol = match self.inner.orders.get(client_order_id) {
            Some(order) if !order.is_terminal() => order.symbol.clone(),
            _ => return Err(GatewayError::OrderNotFound(client_order_id.to_string())),
        };

        let request = CancelOrderRequest {
            category: self.inner.config.category,
            symbol,
            client_order_id: client_order_id.clone(),
        };
        info!(client_order_id = %client_order_id, "Cancelling order");

        self.inner
            .with_retry("cancel_order", || {
                self.inner.rest.cancel_order(request.clone())
            })
            .await
            .map_err(|e| {
                warn!(client_order_id = %client_order_id, error = %e, "Cancel failed");
                GatewayError::from(e)
            })?;
        Ok(())
    }

    /// Apply an `order` topic entry.
    ///
    /// Returns `true` when the update changed a tracked order.
    pub fn apply_order_update(&self, update: &OrderUpdate) -> bool {
        self.inner.apply_update(update)
    }

    /// Bring tracked orders up to date after a reconnect, when stream events
    /// may have been missed.
    ///
    /// Open orders are fetched in one call. Every other tracked order that
    /// has reached the exchange is then looked up by `orderLinkId`, so fills
    /// and cancels that happened meanwhile still land. Returns the number of
    /// tracked orders that changed.
    pub async fn reconcile_open_orders(&self, symbol: Option<String>) -> GatewayResult<usize> {
        let category = self.inner.config.category;
        let open = self
            .inner
            .with_retry("get_open_orders", || {
                self.inner.rest.get_open_orders(category, symbol.clone())
            })
            .await?;

        let mut changed = open
            .iter()
            .filter(|o| self.apply_order_update(&o.to_update()))
            .count();

        // Pending orders are still owned by their submission task
        let missing: Vec<ClientOrderId> = self
            .active_orders()
            .into_iter()
            .filter(|o| o.status != OrderStatus::Pending)
            .filter(|o| symbol.as_ref().map_or(true, |s| *s == o.symbol))
            .filter(|o| !open.iter().any(|e| e.order_link_id == o.client_order_id.as_str()))
            .map(|o| o.client_order_id)
            .collect();

        for client_order_id in &missing {
            let found = self
                .inner
                .with_retry("get_order", || {
                    self.inner.rest.get_order(category, client_order_id.clone())
                })
                .await?;
            match found {
                Some(entry) => {
                    if self.apply_order_update(&entry.to_update()) {
                        changed += 1;
                    }
                }
                None => warn!(
                    client_order_id = %client_order_id,
                    "Tracked order unknown to the exchange"
                ),
            }
        }

        debug!(open = open.len(), looked_up = missing.len(), changed, "Reconciled orders");
        Ok(changed)
    }

    /// Snapshot of a tracked order.
    pub fn get_order(&self, client_order_id: &ClientOrderId) -> GatewayResult<Order> {
        self.inner
            .orders
            .get(client_order_id)
            .map(|o| o.clone())
            .ok_or_else(|| GatewayError::OrderNotFound(client_order_id.to_string()))
    }

    /// Non-terminal orders, oldest first.
    pub fn active_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .inner
            .orders
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.orders.len()
    }

    /// Evict terminal orders older than the retention window.
    pub fn prune_terminal(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let retention_ms = u64::try_from(self.inner.config.retention.as_millis()).unwrap_or(u64::MAX);

        let mut removed = Vec::new();
        self.inner.orders.retain(|id, order| {
            let expired =
                order.is_terminal() && now.saturating_sub(order.last_updated_at) >= retention_ms;
            if expired {
                removed.push(id.clone());
            }
            !expired
        });

        if !removed.is_empty() {
            self.inner
                .by_exchange_id
                .retain(|_, id| !removed.contains(id));
            debug!(count = removed.len(), "Pruned terminal orders");
        }
        removed.len()
    }
}

impl GatewayInner {
    async fn submit(&self, client_order_id: ClientOrderId, request: PlaceOrderRequest) {
        let result = self
            .with_retry("place_order", || self.rest.place_order(request.clone()))
            .await;

        match result {
            Ok(ack) => {
                info!(
                    client_order_id = %client_order_id,
                    order_id = %ack.order_id,
                    "Order accepted"
                );
                if !ack.order_id.is_empty() {
                    self.by_exchange_id
                        .insert(ack.order_id.clone(), client_order_id.clone());
                }
                // May lose to a stream event that already moved the order on
                self.mutate(&client_order_id, |order, now| {
                    let mut changed = false;
                    if order.exchange_order_id.is_none() && !ack.order_id.is_empty() {
                        order.exchange_order_id = Some(ack.order_id.clone());
                        changed = true;
                    }
                    order.transition(OrderStatus::Submitted, None, now) || changed
                });
            }
            Err(e) if e.is_duplicate_link_id() => {
                // An earlier attempt reached the exchange before timing out
                warn!(
                    client_order_id = %client_order_id,
                    error = %e,
                    "Order already on the exchange, resolving by link id"
                );
                self.mutate(&client_order_id, |order, now| {
                    order.transition(OrderStatus::Submitted, None, now)
                });
                self.resolve_by_link_id(&client_order_id).await;
            }
            Err(e) => {
                let error = GatewayError::from(e);
                warn!(client_order_id = %client_order_id, error = %error, "Order submission failed");
                let reason = match &error {
                    GatewayError::ExchangeRejected(message) => message.clone(),
                    other => other.to_string(),
                };
                self.mutate(&client_order_id, |order, now| {
                    let rejected = order.transition(OrderStatus::Rejected, None, now);
                    if rejected {
                        order.reject_reason = Some(reason);
                    }
                    rejected
                });
                self.emit(&OrderEvent::SubmitFailed {
                    client_order_id,
                    error,
                });
            }
        }
    }

    /// Look an order up by `orderLinkId` and apply what the exchange reports.
    ///
    /// A failed lookup leaves the order `Submitted`; the stream or the next
    /// reconciliation moves it on.
    async fn resolve_by_link_id(&self, client_order_id: &ClientOrderId) {
        let lookup = self
            .with_retry("get_order", || {
                self.rest
                    .get_order(self.config.category, client_order_id.clone())
            })
            .await;
        match lookup {
            Ok(Some(entry)) => {
                self.apply_update(&entry.to_update());
            }
            Ok(None) => debug!(
                client_order_id = %client_order_id,
                "Order not visible yet, waiting for the stream"
            ),
            Err(e) => warn!(
                client_order_id = %client_order_id,
                error = %e,
                "Order lookup failed, waiting for the stream"
            ),
        }
    }

    fn apply_update(&self, update: &OrderUpdate) -> bool {
        let Some(client_order_id) = self.resolve(update) else {
            debug!(
                order_id = %update.order_id,
                order_link_id = %update.order_link_id,
                "Update for untracked order"
            );
            return false;
        };

        let status = match OrderStatus::from_exchange(&update.order_status) {
            Ok(status) => status,
            Err(e) => {
                warn!(client_order_id = %client_order_id, error = %e, "Ignoring order update");
                return false;
            }
        };

        if !update.order_id.is_empty() {
            self.by_exchange_id
                .insert(update.order_id.clone(), client_order_id.clone());
        }

        let seq = update.updated_time_ms();
        let cumulative = update.cum_exec_qty();
        let reason = update.reject_reason().map(str::to_string);

        let changed = self.mutate(&client_order_id, |order, now| {
            let mut changed = false;
            if order.exchange_order_id.is_none() && !update.order_id.is_empty() {
                order.exchange_order_id = Some(update.order_id.clone());
                changed = true;
            }

            let stale = matches!(
                (seq, order.last_event_seq),
                (Some(seq), Some(last)) if seq < last
            );
            if stale || order.is_terminal() {
                return changed;
            }

            let fill = cumulative.map_or(Size::ZERO, |c| order.record_fill(c));
            if fill.is_positive() {
                trace!(client_order_id = %order.client_order_id, fill = %fill, "Fill recorded");
            }
            let transitioned = order.transition(status, seq, now);
            if transitioned && status == OrderStatus::Rejected {
                order.reject_reason = reason.clone();
            }
            if !transitioned && fill.is_positive() {
                order.last_updated_at = now;
            }
            changed || transitioned || fill.is_positive()
        });

        match &changed {
            Some(order) => debug!(
                client_order_id = %client_order_id,
                status = %order.status,
                filled = %order.filled_quantity,
                "Order updated from stream"
            ),
            None => debug!(
                client_order_id = %client_order_id,
                exchange_status = %update.order_status,
                "Stale or regressing order update ignored"
            ),
        }
        changed.is_some()
    }

    /// Run `call`, retrying once after the backoff on a transient failure.
    ///
    /// Order placement retries reuse the same `orderLinkId`, so a request
    /// that did reach the exchange is not duplicated.
    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> RestResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RestResult<T>>,
    {
        match call().await {
            Err(e) if e.is_transient() => {
                warn!(
                    op,
                    error = %e,
                    backoff_ms = self.config.retry_backoff.as_millis() as u64,
                    "Transient REST failure, retrying once"
                );
                tokio::time::sleep(self.config.retry_backoff).await;
                call().await
            }
            other => other,
        }
    }

    fn resolve(&self, update: &OrderUpdate) -> Option<ClientOrderId> {
        if !update.order_link_id.is_empty() {
            let id = ClientOrderId::from(update.order_link_id.as_str());
            if self.orders.contains_key(&id) {
                return Some(id);
            }
        }
        self.by_exchange_id
            .get(&update.order_id)
            .map(|entry| entry.value().clone())
    }

    /// Mutate one order under its entry guard. `f` returns whether anything
    /// changed; if so, the new snapshot is emitted after the guard is
    /// released and returned.
    fn mutate<F>(&self, client_order_id: &ClientOrderId, f: F) -> Option<Order>
    where
        F: FnOnce(&mut Order, u64) -> bool,
    {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut entry = self.orders.get_mut(client_order_id)?;
            let before = entry.status;
            if !f(entry.value_mut(), now) {
                return None;
            }
            if entry.status != before {
                Metrics::order_transition(entry.status.as_str());
            }
            entry.value().clone()
        };
        self.emit(&OrderEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    fn emit(&self, event: &OrderEvent) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("Order event handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for OrderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderGateway")
            .field("config", &self.inner.config)
            .field("tracked", &self.inner.orders.len())
            .finish()
    }
}
