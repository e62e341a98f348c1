use dslab_core::{
    event::{EventData, EventId},
    SimulationContext,
};

/// Simulated time in whole ticks (milliseconds). The engine clock is an
/// `f64` that only ever advances by whole-tick delays.
pub type Time = u64;

/// Current engine time in ticks.
pub fn ticks(ctx: &SimulationContext) -> Time {
    ctx.time() as Time
}

/// Timer subscription of a single component.
///
/// The component stores the timer next to its context, arms it with
/// [`subscribe`](Timer::subscribe) or [`subscribe_periodic`](Timer::subscribe_periodic)
/// and forwards every received tick through [`on_fire`](Timer::on_fire).
pub struct Timer<T> {
    tick: T,
    pending: Option<EventId>,
    period: Option<Time>,
}

impl<T: EventData + Clone> Timer<T> {
    pub fn new(tick: T) -> Self {
        Self {
            tick,
            pending: None,
            period: None,
        }
    }

    /// One-shot notification after `delay` ticks, replacing any pending one.
    pub fn subscribe(&mut self, ctx: &SimulationContext, delay: Time) {
        self.cancel_pending(ctx);
        self.period = None;
        self.pending = Some(ctx.emit_self(self.tick.clone(), delay as f64));
    }

    /// Notification every `period` ticks until unsubscribed.
    pub fn subscribe_periodic(&mut self, ctx: &SimulationContext, period: Time) {
        self.cancel_pending(ctx);
        self.period = Some(period);
        self.pending = Some(ctx.emit_self(self.tick.clone(), period as f64));
    }

    pub fn unsubscribe(&mut self, ctx: &SimulationContext) {
        self.cancel_pending(ctx);
        self.period = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn now(&self, ctx: &SimulationContext) -> Time {
        ticks(ctx)
    }

    /// Consumes a delivered tick. Returns `false` for ticks that do not belong
    /// to the live subscription. Periodic subscriptions are re-armed before
    /// returning, so the owner may still unsubscribe while handling the tick.
    pub fn on_fire(&mut self, ctx: &SimulationContext, event_id: EventId) -> bool {
        if self.pending != Some(event_id) {
            return false;
        }
        self.pending = self
            .period
            .map(|period| ctx.emit_self(self.tick.clone(), period as f64));
        true
    }

    fn cancel_pending(&mut self, ctx: &SimulationContext) {
        if let Some(id) = self.pending.take() {
            ctx.cancel_event(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use dslab_core::{cast, Event, EventHandler, Simulation, SimulationContext};
    use serde::Serialize;

    use super::{ticks, Time, Timer};

    #[derive(Clone, Serialize)]
    struct Tick {}

    struct Ticker {
        ctx: SimulationContext,
        timer: Timer<Tick>,
        fired: Vec<Time>,
        stop_after: usize,
    }

    impl EventHandler for Ticker {
        fn on(&mut self, event: Event) {
            let event_id = event.id;
            cast!(match event.data {
                Tick {} => {
                    if self.timer.on_fire(&self.ctx, event_id) {
                        self.fired.push(ticks(&self.ctx));
                        if self.fired.len() == self.stop_after {
                            self.timer.unsubscribe(&self.ctx);
                        }
                    }
                }
            })
        }
    }

    fn ticker(sim: &mut Simulation, stop_after: usize) -> Rc<RefCell<Ticker>> {
        let ticker = Rc::new(RefCell::new(Ticker {
            ctx: sim.create_context("ticker"),
            timer: Timer::new(Tick {}),
            fired: Vec::new(),
            stop_after,
        }));
        sim.add_handler("ticker", ticker.clone());
        ticker
    }

    #[test]
    fn test_periodic_until_unsubscribed() {
        let mut sim = Simulation::new(42);
        let ticker = ticker(&mut sim, 3);
        {
            let mut t = ticker.borrow_mut();
            let t = &mut *t;
            t.timer.subscribe_periodic(&t.ctx, 10);
        }
        sim.step_until_no_events();

        let t = ticker.borrow();
        assert_eq!(t.fired, vec![10, 20, 30]);
        assert!(!t.timer.is_subscribed());
    }

    #[test]
    fn test_resubscribe_replaces_pending_tick() {
        let mut sim = Simulation::new(42);
        let ticker = ticker(&mut sim, 10);
        {
            let mut t = ticker.borrow_mut();
            let t = &mut *t;
            t.timer.subscribe(&t.ctx, 50);
            t.timer.subscribe(&t.ctx, 7);
        }
        sim.step_until_no_events();

        let t = ticker.borrow();
        assert_eq!(t.fired, vec![7]);
        assert!(!t.timer.is_subscribed());
    }
}
