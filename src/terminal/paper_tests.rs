//! Unit tests for the paper terminal.

#[cfg(test)]
mod paper_tests {
    use crate::error::TerminalError;
    use crate::parser::InstrumentTable;
    use crate::terminal::types::{OrderKind, PlaceOrderRequest, Side, SymbolSpec, TerminalPosition};
    use crate::terminal::{PaperTerminal, TradingTerminal};

    fn terminal() -> PaperTerminal {
        let t = PaperTerminal::new();
        t.add_symbol(SymbolSpec {
            symbol: "EURUSD".to_string(),
            pip_size: 0.0001,
            digits: 5,
            volume_min: 0.01,
            volume_step: 0.01,
            volume_max: 50.0,
        });
        t.set_quote("EURUSD", 1.0850, 1.0852);
        t
    }

    fn request(kind: OrderKind, volume: f64, price: f64) -> PlaceOrderRequest {
        PlaceOrderRequest {
            symbol: "EURUSD".to_string(),
            kind,
            volume,
            price,
            stop_loss: Some(1.0800),
            take_profit: Some(1.0950),
            deviation: 0.0005,
            tag: "relay-7701".to_string(),
            comment: "AI Signal".to_string(),
        }
    }

    // ============= Order Placement Tests =============

    #[tokio::test]
    async fn test_market_order_fills_at_quote() {
        let t = terminal();
        let ack = t.place_order(request(OrderKind::Buy, 0.5, 1.0852)).await.unwrap();
        assert!(ack.filled);
        assert_eq!(ack.price, 1.0852);

        let sell = t.place_order(request(OrderKind::Sell, 0.5, 1.0850)).await.unwrap();
        assert_eq!(sell.price, 1.0850);
        assert_ne!(sell.ticket, ack.ticket);

        let positions = t.positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].side, Side::Buy);
        assert_eq!(positions[0].tag, "relay-7701");
        assert_eq!(positions[1].side, Side::Sell);
        assert_eq!(t.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_requote_outside_deviation() {
        let t = terminal();
        let err = t.place_order(request(OrderKind::Buy, 0.5, 1.0800)).await.unwrap_err();
        assert!(matches!(err, TerminalError::OrderRejected { .. }));
        assert!(t.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_volume_checked_against_spec() {
        let t = terminal();
        for volume in [0.005, 0.015, 60.0] {
            let err = t.place_order(request(OrderKind::Buy, volume, 1.0852)).await.unwrap_err();
            assert!(matches!(err, TerminalError::InvalidVolume { .. }), "volume {}", volume);
        }
    }

    #[tokio::test]
    async fn test_unknown_symbol_and_missing_quote() {
        let t = terminal();
        let mut unknown = request(OrderKind::Buy, 0.1, 1.0);
        unknown.symbol = "ZZZUSD".to_string();
        assert!(matches!(
            t.place_order(unknown).await,
            Err(TerminalError::UnknownSymbol { .. })
        ));

        t.add_symbol(SymbolSpec {
            symbol: "GBPUSD".to_string(),
            pip_size: 0.0001,
            digits: 5,
            volume_min: 0.01,
            volume_step: 0.01,
            volume_max: 50.0,
        });
        assert!(matches!(t.quote("GBPUSD").await, Err(TerminalError::NoQuote { .. })));
        let mut no_quote = request(OrderKind::Buy, 0.1, 1.27);
        no_quote.symbol = "GBPUSD".to_string();
        assert!(matches!(t.place_order(no_quote).await, Err(TerminalError::NoQuote { .. })));
    }

    #[tokio::test]
    async fn test_fail_next_order_rejects_once() {
        let t = terminal();
        t.fail_next_order("market closed");

        match t.place_order(request(OrderKind::Buy, 0.1, 1.0852)).await {
            Err(TerminalError::OrderRejected { reason }) => assert_eq!(reason, "market closed"),
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert!(t.place_order(request(OrderKind::Buy, 0.1, 1.0852)).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnected() {
        let t = terminal();
        t.set_connected(false);
        assert_eq!(t.positions().await.unwrap_err(), TerminalError::Disconnected);
        assert_eq!(t.quote("EURUSD").await.unwrap_err(), TerminalError::Disconnected);

        t.set_connected(true);
        assert!(t.quote("EURUSD").await.is_ok());
    }

    // ============= Pending Order Tests =============

    #[tokio::test]
    async fn test_pending_order_rests_until_crossed() {
        let t = terminal();
        let ack = t.place_order(request(OrderKind::BuyLimit, 0.2, 1.0820)).await.unwrap();
        assert!(!ack.filled);
        assert_eq!(t.pending_orders().await.unwrap().len(), 1);
        assert!(t.positions().await.unwrap().is_empty());

        t.set_quote("EURUSD", 1.0830, 1.0832);
        assert!(t.position(ack.ticket).is_none());

        t.set_quote("EURUSD", 1.0818, 1.0820);
        let filled = t.position(ack.ticket).unwrap();
        assert_eq!(filled.open_price, 1.0820);
        assert_eq!(filled.side, Side::Buy);
        assert!(t.pending_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_order() {
        let t = terminal();
        let ack = t.place_order(request(OrderKind::SellStop, 0.2, 1.0800)).await.unwrap();
        t.cancel_order(ack.ticket).await.unwrap();
        assert!(t.pending_orders().await.unwrap().is_empty());
        assert_eq!(
            t.cancel_order(ack.ticket).await.unwrap_err(),
            TerminalError::OrderNotFound { ticket: ack.ticket }
        );
    }

    // ============= Position Management Tests =============

    #[tokio::test]
    async fn test_stop_loss_and_take_profit_exits() {
        let t = terminal();
        let buy = t.place_order(request(OrderKind::Buy, 0.1, 1.0852)).await.unwrap();
        let sell = t.place_order(request(OrderKind::Sell, 0.1, 1.0850)).await.unwrap();
        t.modify_position(sell.ticket, Some(1.0900), Some(1.0700)).await.unwrap();

        // Buy TP at 1.0950 is hit; the sell's SL at 1.0900 as well
        t.set_quote("EURUSD", 1.0951, 1.0953);
        assert!(t.position(buy.ticket).is_none());
        assert!(t.position(sell.ticket).is_none());
    }

    #[tokio::test]
    async fn test_modify_and_close_position() {
        let t = terminal();
        let ack = t.place_order(request(OrderKind::Buy, 0.5, 1.0852)).await.unwrap();

        t.modify_position(ack.ticket, Some(1.0852), Some(1.0950)).await.unwrap();
        assert_eq!(t.position(ack.ticket).unwrap().stop_loss, Some(1.0852));

        let price = t.close_position(ack.ticket, 0.2).await.unwrap();
        assert_eq!(price, 1.0850);
        assert!((t.position(ack.ticket).unwrap().volume - 0.3).abs() < 1e-9);

        t.close_position(ack.ticket, 0.3).await.unwrap();
        assert!(t.position(ack.ticket).is_none());
        assert_eq!(
            t.close_position(ack.ticket, 0.1).await.unwrap_err(),
            TerminalError::PositionNotFound { ticket: ack.ticket }
        );
        assert!(matches!(
            t.modify_position(ack.ticket, None, None).await,
            Err(TerminalError::PositionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_inject_position_assigns_ticket() {
        let t = terminal();
        let ticket = t.inject_position(TerminalPosition {
            ticket: 0,
            symbol: "EURUSD".to_string(),
            side: Side::Sell,
            volume: 1.0,
            open_price: 1.09,
            stop_loss: None,
            take_profit: None,
            tag: "manual".to_string(),
        });
        assert!(ticket > 0);
        assert_eq!(t.position(ticket).unwrap().tag, "manual");
    }

    #[tokio::test]
    async fn test_from_instruments_knows_builtin_symbols() {
        let t = PaperTerminal::from_instruments(&InstrumentTable::builtin());
        let spec = t.symbol_spec("XAUUSD").await.unwrap();
        assert_eq!(spec.pip_size, 0.1);
        assert_eq!(spec.digits, 2);
        assert_eq!(t.name(), "paper");
    }
}
