#[cfg(test)]
mod persistence_tests {
    use analysis_core::Direction;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::{
        CooldownConfig, CooldownScope, CooldownState, CooldownTracker, ExitReason, Fill,
        PositionBook, PositionError, StateStore, TrailingConfig, TrailingPhase,
    };

    async fn pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory SQLite")
    }

    async fn setup_store() -> StateStore {
        let store = StateStore::new(pool().await);
        store.init_tables().await.unwrap();
        store
    }

    fn config() -> CooldownConfig {
        CooldownConfig {
            window: Duration::minutes(60),
            scope: CooldownScope::SameDirection,
        }
    }

    fn fill(symbol: &str) -> Fill {
        Fill {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            price: 100.0,
            quantity: dec!(0.5),
            stop_loss: 98.0,
            take_profit: 110.0,
            order_id: format!("paper-{}", symbol),
            filled_at: Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_state_roundtrip_and_prefix() {
        let store = setup_store().await;
        store.save_state("cooldown:BTCUSDT", "a").await.unwrap();
        store.save_state("cooldown:ETHUSDT", "b").await.unwrap();
        store.save_state("position:BTCUSDT", "c").await.unwrap();
        store.save_state("cooldown:BTCUSDT", "d").await.unwrap();

        let rows = store.load_prefix("cooldown:").await.unwrap();
        assert_eq!(
            rows,
            vec![
                ("cooldown:BTCUSDT".to_string(), "d".to_string()),
                ("cooldown:ETHUSDT".to_string(), "b".to_string()),
            ]
        );

        store.delete_state("position:BTCUSDT").await.unwrap();
        assert!(store.load_state("position:BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_survives_restart() {
        let store = setup_store().await;
        let t0 = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();

        let first = CooldownTracker::new(config(), Some(store.clone()));
        first.record_signal_at("BTCUSDT", Direction::Long, t0).await;
        drop(first);

        let second = CooldownTracker::new(config(), Some(store));
        assert_eq!(second.restore().await, 1);

        let check = second
            .can_signal_at("BTCUSDT", Direction::Long, t0 + Duration::minutes(30))
            .await;
        assert!(!check.allowed);
        assert_eq!(check.state, CooldownState::CoolingDown);
        assert!(!second.is_degraded());
    }

    #[tokio::test]
    async fn test_corrupt_cooldown_row_is_skipped() {
        let store = setup_store().await;
        store.save_state("cooldown:ETHUSDT", "{not json").await.unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let writer = CooldownTracker::new(config(), Some(store.clone()));
        writer.record_signal_at("BTCUSDT", Direction::Short, t0).await;

        let tracker = CooldownTracker::new(config(), Some(store));
        assert_eq!(tracker.restore().await, 1);
        assert!(tracker.record("ETHUSDT").await.is_none());
        assert_eq!(
            tracker.record("BTCUSDT").await.map(|r| r.direction),
            Some(Direction::Short)
        );
    }

    #[tokio::test]
    async fn test_cooldown_degrades_when_store_unavailable() {
        // no init_tables: every write fails
        let store = StateStore::new(pool().await);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();

        let tracker = CooldownTracker::new(config(), Some(store));
        tracker.record_signal_at("BTCUSDT", Direction::Long, t0).await;

        assert!(tracker.is_degraded());
        let check = tracker
            .can_signal_at("BTCUSDT", Direction::Long, t0 + Duration::minutes(1))
            .await;
        assert!(!check.allowed);
    }

    #[tokio::test]
    async fn test_position_book_restores_open_positions() {
        let store = setup_store().await;

        let book = PositionBook::new(TrailingConfig::default(), Some(store.clone()));
        book.open(fill("BTCUSDT")).await.unwrap();
        book.open(fill("ETHUSDT")).await.unwrap();
        assert!(book.on_price("BTCUSDT", 102.0).await.is_none());
        let trailed = book.get("BTCUSDT").await.unwrap();
        assert_eq!(trailed.trailing.phase(), TrailingPhase::Trailing);
        drop(book);

        let restored = PositionBook::new(TrailingConfig::default(), Some(store));
        assert_eq!(restored.restore().await, 2);
        assert_eq!(restored.symbols().await, vec!["BTCUSDT", "ETHUSDT"]);
        let back = restored.get("BTCUSDT").await.unwrap();
        assert_eq!(back.order_id, trailed.order_id);
        assert_eq!(back.quantity, dec!(0.5));
        assert_eq!(back.trailing.phase(), TrailingPhase::Trailing);
        approx::assert_relative_eq!(
            back.trailing.current_stop(),
            trailed.trailing.current_stop(),
            epsilon = 1e-9
        );
    }

    #[tokio::test]
    async fn test_one_position_per_symbol() {
        let book = PositionBook::new(TrailingConfig::default(), Some(setup_store().await));
        book.open(fill("BTCUSDT")).await.unwrap();

        let err = book.open(fill("BTCUSDT")).await.unwrap_err();
        assert_eq!(err, PositionError::PositionExists("BTCUSDT".to_string()));
        assert_eq!(book.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_fill_is_rejected() {
        let book = PositionBook::new(TrailingConfig::default(), None);

        let mut inverted = fill("BTCUSDT");
        inverted.stop_loss = 101.0;
        assert!(matches!(
            book.open(inverted).await,
            Err(PositionError::Invalid(_))
        ));

        let mut empty = fill("BTCUSDT");
        empty.quantity = dec!(0);
        assert!(matches!(book.open(empty).await, Err(PositionError::Invalid(_))));
        assert!(book.is_empty().await);
    }

    #[tokio::test]
    async fn test_exit_removes_persisted_position() {
        let store = setup_store().await;
        let book = PositionBook::new(TrailingConfig::default(), Some(store.clone()));
        book.open(fill("BTCUSDT")).await.unwrap();

        // 102 arms and trails to 101.49, the pullback closes on the trailing stop
        book.on_price("BTCUSDT", 102.0).await;
        let exit = book.on_price("BTCUSDT", 101.2).await.unwrap();

        assert_eq!(exit.reason, ExitReason::TrailingStop);
        approx::assert_relative_eq!(exit.pnl, 0.6, epsilon = 1e-9);
        assert!(!book.has_position("BTCUSDT").await);
        assert!(store.load_state("position:BTCUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_external_close() {
        let book = PositionBook::new(TrailingConfig::default(), None);
        book.open(fill("SOLUSDT")).await.unwrap();

        let exit = book.close("SOLUSDT", 99.0).await.unwrap();
        assert_eq!(exit.reason, ExitReason::External);
        approx::assert_relative_eq!(exit.pnl, -0.5, epsilon = 1e-9);
        assert!(book.close("SOLUSDT", 99.0).await.is_none());
    }
}
