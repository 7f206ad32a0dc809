//! Live polling driver

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::bars::Bar;
use crate::errors::Result;
use crate::helpers::asset_of;
use crate::market::{Gateway, SimulatedGateway};
use crate::strategy::{Strategy, StrategyOptions, StrategyRegistry};
use crate::tape::Tape;

/// Input configuration for creating a LiveRunner
#[derive(Debug, Clone)]
pub struct LiveRunnerInput {
    pub plan: String,
    /// Strategy arguments, pair first
    pub args: Vec<String>,
    pub buy: bool,
    pub poll_interval: Duration,
    pub tape_dir: PathBuf,
    pub options: StrategyOptions,
}

/// Outcome of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// No tick, the same tick as last time, or an older one
    Skipped,
    Continue,
    /// The strategy reported it is done
    Finished,
}

/// Polls the exchange for the newest bar and feeds the strategy.
///
/// Ticks come from `market`. Orders go to `market` too, unless a paper
/// matcher is attached, in which case it sees every bar before the
/// strategy does, exactly as in a replay.
pub struct LiveRunner {
    strategy: Box<dyn Strategy>,
    market: Arc<dyn Gateway>,
    paper: Option<Arc<SimulatedGateway>>,
    tape: Tape,
    previous: Option<Bar>,
    poll_interval: Duration,
    tape_dir: PathBuf,
}

impl LiveRunner {
    pub async fn new(
        input: LiveRunnerInput,
        registry: &StrategyRegistry,
        market: Arc<dyn Gateway>,
        paper: Option<Arc<SimulatedGateway>>,
    ) -> Result<Self> {
        let orders: Arc<dyn Gateway> = match &paper {
            Some(sim) => sim.clone(),
            None => market.clone(),
        };
        let strategy = registry
            .create_strategy(&input.plan, orders.clone(), &input.args, input.buy, &input.options)
            .await?;
        let position = orders.get_position(asset_of(strategy.pair())).await?;
        info!(
            "Strategy '{}' initialized for {} (balance {:.8}, available {:.8})",
            strategy.name(),
            strategy.pair(),
            position.balance,
            position.available
        );
        let tape = Tape::new(&input.plan, strategy.pair(), position, input.args);

        Ok(Self {
            strategy,
            market,
            paper,
            tape,
            previous: None,
            poll_interval: input.poll_interval,
            tape_dir: input.tape_dir,
        })
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Fetch the newest bar and process it once
    pub async fn poll_once(&mut self) -> Result<Poll> {
        let Some(bar) = self.market.get_tick(self.strategy.pair()).await? else {
            debug!("{} no tick", self.strategy.pair());
            return Ok(Poll::Skipped);
        };
        if let Some(previous) = self.previous {
            if previous == bar {
                debug!("{} same tick as before, skipping", self.strategy.pair());
                return Ok(Poll::Skipped);
            }
            if bar.timestamp < previous.timestamp {
                warn!(
                    "{} tick at {} is older than {}, skipping",
                    self.strategy.pair(),
                    bar.timestamp,
                    previous.timestamp
                );
                return Ok(Poll::Skipped);
            }
        }
        self.previous = Some(bar);
        self.tape.record(bar);

        if let Some(paper) = &self.paper {
            paper.feed(&bar).await;
        }
        if self.strategy.on_bar(&bar).await? {
            Ok(Poll::Continue)
        } else {
            Ok(Poll::Finished)
        }
    }

    /// Poll until the strategy finishes, fails or the operator hits Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Poll until the strategy finishes, fails or `shutdown` completes.
    /// `shutdown` is watched during polls as well as between them. The
    /// tape is saved in every case once at least one bar was seen.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting live loop for {} every {:?}", self.strategy.pair(), self.poll_interval);
        tokio::pin!(shutdown);
        let outcome = loop {
            let polled = tokio::select! {
                polled = self.poll_once() => polled,
                _ = &mut shutdown => {
                    warn!("Interrupted by user");
                    break Ok(());
                }
            };
            match polled {
                Ok(Poll::Finished) => {
                    info!("{} plan finished", self.strategy.pair());
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    error!("{} fatal: {}", self.strategy.pair(), e);
                    break Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => {
                    warn!("Interrupted by user");
                    break Ok(());
                }
            }
        };

        if !self.tape.is_empty() {
            match self.tape.save(&self.tape_dir) {
                Ok(path) => info!("Tape saved in {}", path.display()),
                Err(e) => error!("Failed to save tape: {}", e),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::tests::{bar, ts};
    use crate::market::mock::MockGateway;
    use crate::market::{OrderStatus, SimulatedGatewayInput};

    fn input(tape_dir: PathBuf) -> LiveRunnerInput {
        LiveRunnerInput {
            plan: "cut".to_string(),
            args: ["BTC-ETH", "ALL", "90", "110"].iter().map(|s| s.to_string()).collect(),
            buy: false,
            poll_interval: Duration::ZERO,
            tape_dir,
            options: StrategyOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_same_tick_is_a_no_op() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        for b in [bar(0, 101.0, 102.0, 100.0, 101.0), bar(0, 101.0, 102.0, 100.0, 101.0), bar(1, 101.0, 102.0, 100.0, 101.5)] {
            mock.push_tick(b).await;
        }
        let registry = StrategyRegistry::with_defaults();
        let mut runner = LiveRunner::new(input(std::env::temp_dir()), &registry, mock.clone(), None)
            .await
            .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), Poll::Continue);
        let journal_len = runner.strategy().journal().len();
        assert_eq!(runner.poll_once().await.unwrap(), Poll::Skipped);
        assert_eq!(runner.strategy().journal().len(), journal_len);
        assert_eq!(mock.placed.lock().await.len(), 1);
        assert_eq!(runner.tape().candles.len(), 1);

        assert_eq!(runner.poll_once().await.unwrap(), Poll::Continue);
        assert_eq!(runner.tape().candles.len(), 2);
        assert_eq!(runner.tape().balance, 2.0);
    }

    #[tokio::test]
    async fn test_older_tick_is_skipped() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        for b in [bar(5, 101.0, 102.0, 100.0, 101.0), bar(3, 99.0, 99.0, 97.0, 98.0), bar(6, 101.0, 102.0, 100.0, 101.5)] {
            mock.push_tick(b).await;
        }
        let registry = StrategyRegistry::with_defaults();
        let mut runner = LiveRunner::new(input(std::env::temp_dir()), &registry, mock.clone(), None)
            .await
            .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), Poll::Continue);
        let journal_len = runner.strategy().journal().len();
        assert_eq!(runner.poll_once().await.unwrap(), Poll::Skipped);
        assert_eq!(runner.strategy().journal().len(), journal_len);
        // the stop for the dip was never placed
        assert_eq!(mock.placed.lock().await.len(), 1);

        assert_eq!(runner.poll_once().await.unwrap(), Poll::Continue);
        let stamps: Vec<_> = runner.tape().candles.iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![ts(0, 5), ts(0, 6)]);
    }

    #[tokio::test]
    async fn test_interrupt_during_poll_saves_tape() {
        let dir = std::env::temp_dir().join("tbot_live_interrupt_test");
        std::fs::create_dir_all(&dir).unwrap();
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        mock.push_tick(bar(0, 101.0, 102.0, 100.0, 101.0)).await;
        mock.push_tick(bar(1, 101.0, 102.0, 100.0, 101.5)).await;
        // the second poll never gets an answer
        *mock.stall_when_drained.lock().await = true;
        let registry = StrategyRegistry::with_defaults();
        let runner = LiveRunner::new(input(dir.clone()), &registry, mock.clone(), None)
            .await
            .unwrap();

        let shutdown = tokio::time::sleep(Duration::from_millis(100));
        let outcome = tokio::time::timeout(Duration::from_secs(5), runner.run_until(shutdown)).await;
        assert!(matches!(outcome, Ok(Ok(()))));

        let tape = Tape::load(&dir.join("BTC-ETH-2018-01-10T00:00:00.trade")).unwrap();
        assert_eq!(tape.candles.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_paper_fills_before_strategy() {
        let mock = Arc::new(MockGateway::new());
        mock.push_tick(bar(0, 101.0, 102.0, 100.0, 101.0)).await;
        mock.push_tick(bar(1, 105.0, 112.0, 104.0, 111.0)).await;
        let paper = Arc::new(SimulatedGateway::with_market_data(
            SimulatedGatewayInput {
                balance: 2.0,
                available: 2.0,
                ..Default::default()
            },
            mock.clone(),
        ));
        let registry = StrategyRegistry::with_defaults();
        let mut runner = LiveRunner::new(input(std::env::temp_dir()), &registry, mock.clone(), Some(paper.clone()))
            .await
            .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), Poll::Continue);
        assert_eq!(runner.poll_once().await.unwrap(), Poll::Finished);
        // nothing reached the real exchange
        assert!(mock.placed.lock().await.is_empty());
        let history = paper.history().await;
        assert_eq!(history[0].status, OrderStatus::Filled);
        assert_eq!(history[0].fill_price, (112.0 + 104.0) / 2.0);
    }

    #[tokio::test]
    async fn test_run_saves_tape() {
        let dir = std::env::temp_dir().join("tbot_live_run_test");
        std::fs::create_dir_all(&dir).unwrap();
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        mock.push_tick(bar(0, 101.0, 102.0, 100.0, 101.0)).await;
        mock.push_tick(bar(1, 99.0, 99.0, 97.0, 98.0)).await;
        let registry = StrategyRegistry::with_defaults();
        let runner = LiveRunner::new(input(dir.clone()), &registry, mock.clone(), None)
            .await
            .unwrap();

        // a rejected placement is fatal and still leaves a tape behind
        *mock.reject_other.lock().await = Some("MIN_TRADE_REQUIREMENT_NOT_MET".to_string());
        assert!(runner.run().await.is_err());

        let tape = Tape::load(&dir.join("BTC-ETH-2018-01-10T00:00:00.trade")).unwrap();
        assert_eq!(tape.plan, "cut");
        assert_eq!(tape.candles.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
