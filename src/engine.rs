use crate::browser;
use anyhow::{anyhow, Result};
// ELI5: web assembly is a single threaded environment, so Rc RefCell > Mutex
use async_trait::async_trait;
use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{error, warn};

#[async_trait(?Send)]
pub trait Game {
    async fn initialize(&self) -> Result<Box<dyn Game>>;
    /// one fixed logic step of `delta_ms`
    fn update(&mut self, delta_ms: f64);
}

// length of a frame in milliseconds
pub const FRAME_MS: f64 = 1.0 / 60.0 * 1000.0;

// a stalled tab must not replay minutes of logic in one frame
const MAX_CATCH_UP_MS: f64 = 250.0;

/// Turns raw `requestAnimationFrame` timestamps into a number of fixed steps.
///
/// ELI5:
/// ┌──────────── frame at t=40ms (last at t=0) ────────────┐
/// │ accumulated = 40                                      │
/// │ 40 > 16.6 → step (23.4 left)                          │
/// │ 23.4 > 16.6 → step (6.8 left)                         │
/// │ 6.8 carried over to the next frame                    │
/// └───────────────────────────────────────────────────────┘
#[derive(Debug, Clone)]
pub struct FrameClock {
    last_frame: f64,
    accumulated_delta: f64,
}

impl FrameClock {
    pub fn new(now: f64) -> Self {
        FrameClock {
            last_frame: now,
            accumulated_delta: 0.0,
        }
    }

    /// Number of fixed steps due at `now`.
    pub fn advance(&mut self, now: f64) -> u32 {
        let elapsed = (now - self.last_frame).max(0.0);
        self.last_frame = now;
        self.accumulated_delta = (self.accumulated_delta + elapsed).min(MAX_CATCH_UP_MS);

        let mut steps = 0;
        while self.accumulated_delta > FRAME_MS {
            self.accumulated_delta -= FRAME_MS;
            steps += 1;
        }
        steps
    }

    pub fn accumulated(&self) -> f64 {
        self.accumulated_delta
    }
}

pub struct GameLoop;

type SharedLoopClosure = Rc<RefCell<Option<browser::LoopClosure>>>;

impl GameLoop {
    pub async fn start(game: impl Game + 'static) -> Result<()> {
        let mut game = game.initialize().await?;
        let mut clock = FrameClock::new(browser::now()?);

        let f: SharedLoopClosure = Rc::new(RefCell::new(None));
        let g = f.clone();
        *g.borrow_mut() = Some(browser::create_raf_closure(move |perf: f64| {
            for _ in 0..clock.advance(perf) {
                game.update(FRAME_MS);
            }
            match f.borrow().as_ref() {
                Some(closure) => {
                    if let Err(err) = browser::request_animation_frame(closure) {
                        error!(%err, "game loop stopped");
                    }
                }
                None => warn!("game loop closure missing"),
            }
        }));

        browser::request_animation_frame(
            g.borrow()
                .as_ref()
                .ok_or_else(|| anyhow!("GameLoop: Loop is None"))?,
        )?;

        Ok(())
    }
}

// ==================== Spawning ====================

/// Somewhere to run `!Send` futures to completion.
pub trait Spawner {
    fn spawn(&self, future: LocalBoxFuture<'static, ()>);
}

/// Runs futures on the browser microtask queue.
pub struct BrowserSpawner;

impl Spawner for BrowserSpawner {
    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        browser::spawn_local(future);
    }
}

/// Runs futures on a `futures::executor::LocalPool`, for native code.
impl Spawner for LocalSpawner {
    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(err) = self.spawn_local(future) {
            warn!(%err, "local pool is gone, future dropped");
        }
    }
}
