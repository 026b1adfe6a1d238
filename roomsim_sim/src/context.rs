//! Simulation context implementing RoomContext for deterministic runs.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use roomsim_env::RoomContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by a virtual clock and seeded RNG.
///
/// This implements `RoomContext` using:
/// - A virtual clock that only moves when advanced or slept on
/// - A seeded ChaCha8 RNG for scenario placement and jitter
/// - An epoch offset so event timestamps look like real epoch milliseconds
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<AtomicU64>,

    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Virtual time 0 maps to this wall-clock time
    epoch: SystemTime,
}

impl SimContext {
    /// 2024-01-01 00:00:00 UTC
    pub const EPOCH_SECS: u64 = 1_704_067_200;

    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(Self::EPOCH_SECS),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::SeqCst)
    }

    /// Runs `f` with the shared seeded RNG.
    pub fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl RoomContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping is how simulated time moves forward.
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "spawning simulated task");
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use roomsim_core::{Entity, EntityKind, Room, RoomConfig, RoomHandle, Zone};
    use roomsim_env::RoomId;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.now_ms(), SimContext::EPOCH_SECS * 1000 + 1500);
    }

    #[test]
    fn test_sim_context_deterministic_rng() {
        let a: Vec<u32> = SimContext::new(7).with_rng(|rng| (0..4).map(|_| rng.gen()).collect());
        let b: Vec<u32> = SimContext::new(7).with_rng(|rng| (0..4).map(|_| rng.gen()).collect());
        let c: Vec<u32> = SimContext::new(8).with_rng(|rng| (0..4).map(|_| rng.gen()).collect());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(ctx2.seed(), 42);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_clock() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.time_ns(), 50_000_000);
    }

    #[tokio::test]
    async fn test_spawned_room_on_virtual_clock_serves_commands() {
        let ctx = SimContext::shared(3);
        let config = RoomConfig::default()
            .with_tick_rate(20)
            .with_zone(Zone::new("plaza", 0.0, 0.0, 100.0, 100.0));
        let room = Room::new(RoomId::from_seed(3), ctx.clone(), config).unwrap();
        let handle = RoomHandle::spawn(room);

        assert!(handle.join(Entity::new("alice", EntityKind::Player, 5.0, 5.0)).await.unwrap());
        assert_eq!(handle.zone_population("plaza").await.unwrap(), 1);
        assert!(ctx.now() > Duration::ZERO);

        handle.shutdown().await.unwrap();
        for _ in 0..100 {
            if handle.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_closed());
    }
}
