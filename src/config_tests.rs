//! Unit tests for configuration structures and parsing.

#[cfg(test)]
mod config_tests {
    use crate::config::*;
    use crate::events::ExecutionMode;
    use chrono::NaiveTime;

    const FULL_CONFIG: &str = r#"
data_dir: /tmp/relay
api:
  bind: "127.0.0.1:8080"
parser:
  rule_gate_confidence: 0.9
dedup:
  window_hours: 12
dispatcher:
  fallback_lot: 0.05
  require_stop_loss: true
accounts:
  main:
    channels: [vip-gold]
    risk:
      account_balance: 10000
      risk_percent: 2
      max_lot: 5
      execution_mode: semi-auto
      allowed_pairs: [XAUUSD]
      max_daily_trades: 3
stealth:
  poll_interval_ms: 250
  trading_hours:
    start: "08:00"
    end: "17:30"
rules:
  - id: gold-buy
    pattern: "gold buy"
    channel_scope: vip-gold
    default_pair: XAUUSD
    default_action: buy
    priority: 10
instruments:
  XAUUSD:
    pip_value_per_lot: 1.0
"#;

    // ============= AppConfig Tests =============

    #[test]
    fn test_app_config_full_yaml() {
        let config = AppConfig::from_yaml(FULL_CONFIG).unwrap();

        assert_eq!(config.data_dir.to_str(), Some("/tmp/relay"));
        assert_eq!(config.api.bind, "127.0.0.1:8080");
        assert_eq!(config.parser.rule_gate_confidence, 0.9);
        assert_eq!(config.dedup.window_hours, 12);
        assert_eq!(config.dedup.sweep_cron, "0 */10 * * * *");
        assert_eq!(config.dispatcher.fallback_lot, 0.05);
        assert!(config.dispatcher.require_stop_loss);

        let main = &config.accounts["main"];
        assert!(main.follows("vip-gold"));
        assert!(!main.follows("free-signals"));
        assert_eq!(main.risk.execution_mode, ExecutionMode::SemiAuto);
        assert_eq!(main.risk.max_daily_trades, Some(3));
        assert_eq!(main.risk.min_confidence, 0.85);
        assert!(main.risk.auto_breakeven);

        assert_eq!(config.stealth.poll_interval_ms, 250);
        assert_eq!(config.stealth.max_delay_ms, 3000);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].id, "gold-buy");
        assert_eq!(config.rules[0].priority, 10);
        assert!(config.rules[0].is_active);
        assert_eq!(config.instruments["XAUUSD"].pip_value_per_lot, Some(1.0));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_empty_yaml_uses_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();

        assert_eq!(config.data_dir.to_str(), Some("./data"));
        assert_eq!(config.api.bind, "0.0.0.0:3000");
        assert_eq!(config.parser.rule_gate_confidence, 0.85);
        assert_eq!(config.dedup.window_hours, 24);
        assert_eq!(config.dispatcher.fallback_lot, 0.01);
        assert_eq!(config.dispatcher.comment, "AI Signal");
        assert!(!config.dispatcher.require_stop_loss);
        assert!(config.accounts.is_empty());
        assert_eq!(config.stealth.ownership_tag, "relay-7701");
        assert!(config.stealth.split_take_profits);
        assert!(config.stealth.trading_hours.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_strips_bom() {
        let config = AppConfig::from_yaml("\u{feff}dedup:\n  window_hours: 6\n").unwrap();
        assert_eq!(config.dedup.window_hours, 6);
    }

    #[test]
    fn test_app_config_missing_file() {
        let result = AppConfig::load_from("/nonexistent/relay/config.yaml");
        assert!(matches!(result, Err(crate::error::ConfigError::Read { .. })));
    }

    // ============= Validation Tests =============

    #[test]
    fn test_validate_rejects_bad_gate() {
        let config = AppConfig::from_yaml("parser:\n  rule_gate_confidence: 1.5\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = AppConfig::from_yaml("stealth:\n  min_delay_ms: 5000\n  max_delay_ms: 100\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_lot_bounds() {
        let yaml = r#"
accounts:
  broken:
    risk:
      account_balance: 1000
      risk_percent: 1
      max_lot: 0.01
      min_lot: 0.1
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_validate_rejects_bad_trading_hours() {
        let yaml = "stealth:\n  trading_hours:\n    start: \"25:00\"\n    end: \"10:00\"\n";
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    // ============= TradingHours Tests =============

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_trading_hours_same_day() {
        let hours = TradingHours {
            start: "08:00".to_string(),
            end: "17:00".to_string(),
        };
        assert!(hours.contains(at(8, 0)));
        assert!(hours.contains(at(12, 30)));
        assert!(!hours.contains(at(17, 0)));
        assert!(!hours.contains(at(7, 59)));
    }

    #[test]
    fn test_trading_hours_wraps_midnight() {
        let hours = TradingHours {
            start: "22:00".to_string(),
            end: "02:00".to_string(),
        };
        assert!(hours.contains(at(23, 0)));
        assert!(hours.contains(at(1, 59)));
        assert!(!hours.contains(at(12, 0)));
    }

    #[test]
    fn test_account_without_channels_follows_all() {
        let yaml = r#"
accounts:
  all:
    risk:
      account_balance: 1000
      risk_percent: 1
      max_lot: 1
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert!(config.accounts["all"].follows("anything"));
    }
}
