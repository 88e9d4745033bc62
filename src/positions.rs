// ===============================
// src/positions.rs (single open position per instrument)
// ===============================
//
// On every signal transition:
//   1. look up the latest open order of the instrument
//   2. close it
//   3. open a new order on the signal's side at the current mid
//   4. append the signal record
//
// Close and open are one logical step: if 1 or 2 fails nothing is opened,
// so an instrument never ends up with two open orders. The caller keeps
// the old signal state and the transition is offered again next tick.
//
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{Event, Order, SignalRecord};
use crate::error::PositionError;
use crate::metrics::ORDERS;
use crate::store::Store;
use crate::strategy::Crossover;

#[derive(Clone)]
pub struct PositionManager {
    store: Arc<dyn Store>,
    quantity: Decimal,
    journal: Option<mpsc::Sender<Event>>,
}

impl PositionManager {
    pub fn new(store: Arc<dyn Store>, quantity: Decimal, journal: Option<mpsc::Sender<Event>>) -> Self {
        Self { store, quantity, journal }
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(ev);
        }
    }

    /// Apply a transition. A NONE crossover is a no-op returning `Ok(None)`.
    pub async fn on_signal(
        &self,
        instrument: &str,
        crossover: &Crossover,
        price: Decimal,
    ) -> Result<Option<Order>, PositionError> {
        let Some(side) = crossover.signal.side() else {
            return Ok(None);
        };

        let prior = self
            .store
            .get_last_open_order(instrument)
            .await
            .map_err(PositionError::Lookup)?;
        if let Some(prior) = prior {
            self.store
                .close_order(prior.id)
                .await
                .map_err(|source| PositionError::Close { id: prior.id, source })?;
            info!(%instrument, id = %prior.id, side = prior.side.as_str(), "closed previous order");
            self.record(Event::OrderClosed { id: prior.id, instrument: instrument.to_string() });
        }

        let order = Order::open(instrument, side, price, self.quantity);
        self.store.save_order(&order).await.map_err(PositionError::Open)?;
        ORDERS.with_label_values(&[side.as_str()]).inc();
        info!(%instrument, id = %order.id, side = side.as_str(), %price, qty = %self.quantity, "order opened");
        self.record(Event::Order(order.clone()));

        let rec = SignalRecord {
            instrument: instrument.to_string(),
            kind: crossover.signal,
            price,
            short_average: crossover.short_avg,
            long_average: crossover.long_avg,
            reason: crossover.reason.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.save_signal(&rec).await {
            warn!(?e, %instrument, "signal record not saved");
            return Err(PositionError::Audit(e));
        }
        self.record(Event::Signal(rec));
        Ok(Some(order))
    }
}
