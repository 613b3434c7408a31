//! Unit tests for the stealth execution engine, driven against the paper terminal.

#[cfg(test)]
mod stealth_tests {
    use crate::bus::EventBus;
    use crate::config::{StealthConfig, TradingHours};
    use crate::data::channel::{ChannelRead, ExecutionChannel, EMPTY_PLACEHOLDER};
    use crate::data::store::{KeyValueStore, MemoryStore};
    use crate::events::*;
    use crate::services::stealth::{EngineState, StealthEngine};
    use crate::terminal::types::{OrderKind, Side, SymbolSpec, TerminalPosition};
    use crate::terminal::PaperTerminal;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    const ACCOUNT: &str = "acc-1";

    struct Rig {
        engine: StealthEngine,
        paper: PaperTerminal,
        channel: ExecutionChannel,
        store: Arc<MemoryStore>,
        bus: EventBus,
    }

    fn config() -> StealthConfig {
        StealthConfig {
            min_delay_ms: 1000,
            max_delay_ms: 1000,
            max_jitter_pips: 0.0,
            ..StealthConfig::default()
        }
    }

    fn rig_with(config: StealthConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let channel = ExecutionChannel::new(store.clone());
        let paper = PaperTerminal::new();
        paper.add_symbol(SymbolSpec {
            symbol: "XAUUSD".to_string(),
            pip_size: 0.1,
            digits: 2,
            volume_min: 0.01,
            volume_step: 0.01,
            volume_max: 100.0,
        });
        paper.set_quote("XAUUSD", 1985.0, 1985.3);
        let bus = EventBus::new(100);
        let engine = StealthEngine::new(ACCOUNT, channel.clone(), Arc::new(paper.clone()), config, bus.clone()).with_seed(7);
        Rig {
            engine,
            paper,
            channel,
            store,
            bus,
        }
    }

    fn rig() -> Rig {
        rig_with(config())
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    fn open_order() -> DispatchedOrder {
        DispatchedOrder {
            signal_id: "sig-1".to_string(),
            symbol: "XAUUSD".to_string(),
            action: TradeAction::Buy,
            intent: SignalIntent::OpenTrade,
            entry: Some(1985.0),
            stop_loss: Some(1975.0),
            take_profits: vec![1995.0],
            lot_size: 0.2,
            order_type: OrderType::Market,
            delay_ms: 0,
            partial_close_percent: 0.0,
            move_sl_to_breakeven: true,
            sl_increase_pips: None,
            risk_amount: Some(200.0),
            pip_distance: Some(100.0),
            comment: "AI Signal".to_string(),
            consumed: false,
            checksum: String::new(),
        }
    }

    fn management(intent: SignalIntent) -> DispatchedOrder {
        DispatchedOrder {
            intent,
            action: TradeAction::None,
            entry: None,
            stop_loss: None,
            take_profits: vec![],
            lot_size: 0.0,
            move_sl_to_breakeven: false,
            risk_amount: None,
            pip_distance: None,
            ..open_order()
        }
    }

    fn statuses(reports: &[ExecutionReport]) -> Vec<ExecutionStatus> {
        reports.iter().map(|r| r.status).collect()
    }

    /// Publish an open order and run the engine until it is placed.
    async fn place(rig: &mut Rig, order: DispatchedOrder) -> Vec<ExecutionReport> {
        rig.channel.publish(ACCOUNT, &order).unwrap();
        assert!(rig.engine.tick(noon()).await.is_empty());
        rig.engine.tick(noon() + ms(1000)).await
    }

    // ============= Delay and Placement Tests =============

    #[tokio::test]
    async fn test_order_held_for_delay_then_placed() {
        let mut rig = rig();
        rig.channel.publish(ACCOUNT, &open_order()).unwrap();

        assert!(rig.engine.tick(noon()).await.is_empty());
        assert!(matches!(rig.engine.state(), EngineState::Delaying { .. }));
        assert!(rig.engine.tick(noon() + ms(500)).await.is_empty());
        assert!(rig.paper.requests().is_empty());

        let reports = rig.engine.tick(noon() + ms(1000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed]);
        assert_eq!(reports[0].price, Some(1985.3));
        assert_eq!(reports[0].volume, Some(0.2));
        assert_eq!(*rig.engine.state(), EngineState::Idle);

        let request = &rig.paper.requests()[0];
        assert_eq!(request.kind, OrderKind::Buy);
        assert_eq!(request.tag, "relay-7701");
        assert_eq!(request.stop_loss, Some(1975.0));
        assert_eq!(request.take_profit, Some(1995.0));
        // Buys pay up by the spread
        assert!((request.price - 1985.6).abs() < 1e-9);

        let ticket = reports[0].ticket.unwrap();
        assert!(rig.engine.tracker().has_position(ticket));
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);
        assert_eq!(rig.channel.raw(ACCOUNT).unwrap().as_deref(), Some(EMPTY_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_order_delay_floor_respected() {
        let mut rig = rig();
        let mut order = open_order();
        order.delay_ms = 2500;
        rig.channel.publish(ACCOUNT, &order).unwrap();

        rig.engine.tick(noon()).await;
        assert!(rig.engine.tick(noon() + ms(1000)).await.is_empty());
        let reports = rig.engine.tick(noon() + ms(2500)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed]);
    }

    #[tokio::test]
    async fn test_same_content_not_executed_twice() {
        let mut rig = rig();
        place(&mut rig, open_order()).await;

        for i in 2..5 {
            assert!(rig.engine.tick(noon() + ms(1000 * i)).await.is_empty());
        }
        assert_eq!(rig.paper.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_order_replaces_delayed() {
        let mut rig = rig();
        rig.channel.publish(ACCOUNT, &open_order()).unwrap();
        rig.engine.tick(noon()).await;

        let mut newer = open_order();
        newer.lot_size = 0.3;
        rig.channel.publish(ACCOUNT, &newer).unwrap();
        rig.engine.tick(noon() + ms(500)).await;

        assert!(rig.engine.tick(noon() + ms(1000)).await.is_empty());
        let reports = rig.engine.tick(noon() + ms(1500)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed]);
        assert_eq!(rig.paper.requests().len(), 1);
        assert_eq!(rig.paper.requests()[0].volume, 0.3);
    }

    #[tokio::test]
    async fn test_broker_rejection_consumes_without_retry() {
        let mut rig = rig();
        rig.paper.fail_next_order("not enough money");

        let reports = place(&mut rig, open_order()).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Failed]);
        assert!(reports[0].detail.as_deref().unwrap().contains("not enough money"));
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);

        assert!(rig.engine.tick(noon() + ms(5000)).await.is_empty());
        assert_eq!(rig.paper.requests().len(), 1);
        assert!(rig.engine.tracker().get_all_positions().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_content_consumed() {
        let mut rig = rig();
        rig.store.set("channel.acc-1", "not json at all").unwrap();

        assert!(rig.engine.tick(noon()).await.is_empty());
        assert_eq!(rig.channel.raw(ACCOUNT).unwrap().as_deref(), Some(EMPTY_PLACEHOLDER));
        assert!(rig.paper.requests().is_empty());
    }

    #[tokio::test]
    async fn test_outside_trading_hours_skipped() {
        let mut cfg = config();
        cfg.trading_hours = Some(TradingHours {
            start: "08:00".to_string(),
            end: "17:00".to_string(),
        });
        let mut rig = rig_with(cfg);
        rig.channel.publish(ACCOUNT, &open_order()).unwrap();

        let evening = Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap();
        let reports = rig.engine.tick(evening).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Skipped]);
        assert_eq!(*rig.engine.state(), EngineState::Idle);
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);
        assert!(rig.engine.tick(evening + ms(5000)).await.is_empty());
        assert!(rig.paper.requests().is_empty());
    }

    #[tokio::test]
    async fn test_window_closing_during_delay_skips_order() {
        let mut cfg = config();
        cfg.trading_hours = Some(TradingHours {
            start: "08:00".to_string(),
            end: "17:00".to_string(),
        });
        let mut rig = rig_with(cfg);
        rig.channel.publish(ACCOUNT, &open_order()).unwrap();

        let before_close = Utc.with_ymd_and_hms(2026, 3, 2, 16, 59, 59).unwrap() + ms(500);
        assert!(rig.engine.tick(before_close).await.is_empty());
        assert!(matches!(rig.engine.state(), EngineState::Delaying { .. }));

        let reports = rig.engine.tick(before_close + ms(1000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Skipped]);
        assert_eq!(reports[0].detail.as_deref(), Some("outside trading hours"));
        assert_eq!(*rig.engine.state(), EngineState::Idle);
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);
        assert!(rig.paper.requests().is_empty());
    }

    #[tokio::test]
    async fn test_reports_published_on_bus() {
        let mut rig = rig();
        let mut rx = rig.bus.subscribe();
        place(&mut rig, open_order()).await;

        match rx.recv().await {
            Ok(Event::Execution(report)) => {
                assert_eq!(report.account, ACCOUNT);
                assert_eq!(report.status, ExecutionStatus::Placed);
            }
            other => panic!("Expected Execution event, got {:?}", other),
        }
    }

    // ============= Take-Profit Ladder Tests =============

    #[tokio::test]
    async fn test_tp_ladder_split_into_legs() {
        let mut rig = rig();
        let mut order = open_order();
        order.take_profits = vec![1995.0, 2005.0];

        let reports = place(&mut rig, order).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed, ExecutionStatus::Placed]);

        let legs: Vec<(f64, Option<f64>)> = rig
            .paper
            .requests()
            .iter()
            .map(|r| (r.volume, r.take_profit))
            .collect();
        assert_eq!(legs, vec![(0.1, Some(1995.0)), (0.1, Some(2005.0))]);
        assert_eq!(rig.engine.tracker().get_all_positions().len(), 2);
    }

    #[tokio::test]
    async fn test_tp_ladder_first_level_when_split_disabled() {
        let mut cfg = config();
        cfg.split_take_profits = false;
        let mut rig = rig_with(cfg);
        let mut order = open_order();
        order.take_profits = vec![1995.0, 2005.0];

        place(&mut rig, order).await;
        let requests = rig.paper.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].volume, 0.2);
        assert_eq!(requests[0].take_profit, Some(1995.0));
    }

    // ============= Breakeven Tests =============

    #[tokio::test]
    async fn test_breakeven_applied_once() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        // +10 pips: below the trigger
        rig.paper.set_quote("XAUUSD", 1986.3, 1986.6);
        assert!(rig.engine.tick(noon() + ms(2000)).await.is_empty());

        rig.paper.set_quote("XAUUSD", 1987.0, 1987.3);
        let reports = rig.engine.tick(noon() + ms(3000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Modified]);
        assert_eq!(reports[0].detail.as_deref(), Some("breakeven"));
        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1985.3));
        assert!(rig.engine.tracker().get_position(ticket).unwrap().breakeven_applied);

        rig.paper.set_quote("XAUUSD", 1990.0, 1990.3);
        assert!(rig.engine.tick(noon() + ms(4000)).await.is_empty());
    }

    #[tokio::test]
    async fn test_breakeven_skipped_when_disabled() {
        let mut rig = rig();
        let mut order = open_order();
        order.move_sl_to_breakeven = false;
        let ticket = place(&mut rig, order).await[0].ticket.unwrap();

        rig.paper.set_quote("XAUUSD", 1990.0, 1990.3);
        assert!(rig.engine.tick(noon() + ms(2000)).await.is_empty());
        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1975.0));
    }

    // ============= Management Tests =============

    #[tokio::test]
    async fn test_partial_close() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        let mut close = management(SignalIntent::ClosePartial);
        close.partial_close_percent = 50.0;
        rig.channel.publish(ACCOUNT, &close).unwrap();

        let reports = rig.engine.tick(noon() + ms(2000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::PartiallyClosed]);
        assert_eq!(reports[0].volume, Some(0.1));
        assert_eq!(rig.paper.position(ticket).unwrap().volume, 0.1);
        assert_eq!(rig.engine.tracker().get_position(ticket).unwrap().volume, 0.1);
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);
    }

    #[tokio::test]
    async fn test_close_without_percent_closes_all() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        rig.channel.publish(ACCOUNT, &management(SignalIntent::ClosePartial)).unwrap();
        let reports = rig.engine.tick(noon() + ms(2000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Closed]);
        assert!(rig.paper.position(ticket).is_none());
        assert!(!rig.engine.tracker().has_position(ticket));
    }

    #[tokio::test]
    async fn test_modify_sl_explicit_and_tighten() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        let mut modify = management(SignalIntent::ModifySl);
        modify.stop_loss = Some(1980.0);
        rig.channel.publish(ACCOUNT, &modify).unwrap();
        let reports = rig.engine.tick(noon() + ms(2000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Modified]);
        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1980.0));

        let mut tighten = management(SignalIntent::ModifySl);
        tighten.sl_increase_pips = Some(20.0);
        tighten.signal_id = "sig-2".to_string();
        rig.channel.publish(ACCOUNT, &tighten).unwrap();
        rig.engine.tick(noon() + ms(3000)).await;
        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1982.0));
    }

    #[tokio::test]
    async fn test_modify_sl_to_breakeven() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        let mut modify = management(SignalIntent::ModifySl);
        modify.move_sl_to_breakeven = true;
        rig.channel.publish(ACCOUNT, &modify).unwrap();
        rig.engine.tick(noon() + ms(2000)).await;

        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1985.3));
        assert!(rig.engine.tracker().get_position(ticket).unwrap().breakeven_applied);
    }

    #[tokio::test]
    async fn test_cancel_pending_order() {
        let mut rig = rig();
        let mut order = open_order();
        order.order_type = OrderType::Pending;
        order.entry = Some(1980.0);

        let reports = place(&mut rig, order).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed]);
        assert_eq!(reports[0].detail.as_deref(), Some("pending"));
        assert_eq!(rig.paper.requests()[0].kind, OrderKind::BuyLimit);
        assert_eq!(rig.engine.tracker().get_all_pending().len(), 1);

        rig.channel.publish(ACCOUNT, &management(SignalIntent::Cancel)).unwrap();
        let reports = rig.engine.tick(noon() + ms(2000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Cancelled]);
        assert!(rig.engine.tracker().get_all_pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_delay_drops_order() {
        let mut rig = rig();
        rig.channel.publish(ACCOUNT, &open_order()).unwrap();
        rig.engine.tick(noon()).await;

        rig.channel.publish(ACCOUNT, &management(SignalIntent::Cancel)).unwrap();
        let reports = rig.engine.tick(noon() + ms(200)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Cancelled]);
        assert_eq!(reports[0].detail.as_deref(), Some("dropped during delay"));
        assert_eq!(*rig.engine.state(), EngineState::Idle);

        assert!(rig.engine.tick(noon() + ms(2000)).await.is_empty());
        assert!(rig.paper.requests().is_empty());
        assert_eq!(rig.channel.read(ACCOUNT).unwrap(), ChannelRead::Empty);
    }

    #[tokio::test]
    async fn test_management_runs_while_delaying() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        let mut second = open_order();
        second.signal_id = "sig-2".to_string();
        rig.channel.publish(ACCOUNT, &second).unwrap();
        rig.engine.tick(noon() + ms(2000)).await;
        assert!(matches!(rig.engine.state(), EngineState::Delaying { .. }));

        let mut modify = management(SignalIntent::ModifySl);
        modify.stop_loss = Some(1980.0);
        rig.channel.publish(ACCOUNT, &modify).unwrap();
        let reports = rig.engine.tick(noon() + ms(2500)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Modified]);
        assert_eq!(rig.paper.position(ticket).unwrap().stop_loss, Some(1980.0));
        assert!(matches!(rig.engine.state(), EngineState::Delaying { .. }));

        let reports = rig.engine.tick(noon() + ms(3000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Placed]);
    }

    // ============= Reconciliation Tests =============

    #[tokio::test]
    async fn test_position_closed_on_terminal_reported() {
        let mut rig = rig();
        let ticket = place(&mut rig, open_order()).await[0].ticket.unwrap();

        // TP 1995 reached
        rig.paper.set_quote("XAUUSD", 1996.0, 1996.3);
        assert!(rig.paper.position(ticket).is_none());

        let reports = rig.engine.tick(noon() + ms(2000)).await;
        assert_eq!(statuses(&reports), vec![ExecutionStatus::Closed]);
        assert_eq!(reports[0].ticket, Some(ticket));
        assert!(!rig.engine.tracker().has_position(ticket));
    }

    #[tokio::test]
    async fn test_foreign_positions_left_alone() {
        let mut rig = rig();
        rig.paper.inject_position(TerminalPosition {
            ticket: 0,
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            volume: 1.0,
            open_price: 1970.0,
            stop_loss: Some(1960.0),
            take_profit: None,
            tag: "manual".to_string(),
        });
        rig.paper.set_quote("XAUUSD", 1990.0, 1990.3);

        let mut close = management(SignalIntent::ClosePartial);
        close.partial_close_percent = 50.0;
        rig.channel.publish(ACCOUNT, &close).unwrap();

        assert!(rig.engine.tick(noon()).await.is_empty());
        assert!(rig.engine.tracker().get_all_positions().is_empty());
        assert_eq!(rig.paper.position(1).unwrap().volume, 1.0);
    }
}
