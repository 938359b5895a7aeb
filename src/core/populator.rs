//! Idle-triggered background populator for animation frame caches
//!
//! **Why**: Rendering an animated frame from the layer graph is expensive.
//! While the user is not painting, the populator walks every registered
//! cache, asks the image engine to regenerate the first missing frame,
//! converts the result for display on a worker thread and commits it.
//!
//! # State machine
//!
//! ```text
//!            idle x threshold, candidate found
//! WaitingForIdle ─────────────────────────────► WaitingForFrame
//!   ▲  │ no candidate                              │ FrameReady(image, time)
//!   │  ▼                                           ▼
//!   │ NotWaitingForAnything              WaitingForConvertedFrame
//!   │  (re-armed by invalidation)                  │ conversion done
//!   │                                              ▼
//!   └──────────── timeout / failure ───────── BetweenFrames ──► (idle check)
//! ```
//!
//! # Threading
//!
//! All transitions run on the controller thread inside `tick()`. Other
//! threads only talk to it through channels:
//! - render thread → `FrameReadyNotifier` (bounded)
//! - worker thread → conversion results
//! - any thread emitting `CacheChangedEvent` → re-arm queue
//!
//! Only a notification naming the exact (image, time) in flight moves the
//! state machine. Any other one (an on-demand render from `fetch`, a late
//! answer to an abandoned request) is converted and committed on the side
//! if its frame is still missing, and otherwise dropped.

use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender, TryRecvError, TrySendError};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::cache_events::{CacheChangedEvent, PopulatorStateChangedEvent};
use super::color::{ConversionError, DisplayConverter};
use super::event_bus::{EventBus, EventEmitter};
use super::frame::{Frame, RawFrame};
use super::frame_cache::{FrameCache, FrameStatus};
use super::registry::CacheRegistry;
use super::time_range::FrameSet;
use super::workers::Workers;
use crate::entities::{AnimatedImage, HostContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PopulatorState {
    WaitingForIdle,
    WaitingForFrame,
    WaitingForConvertedFrame,
    BetweenFrames,
    NotWaitingForAnything,
}

/// Tunable timing constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulatorConfig {
    /// Period of the idleness check
    pub idle_check_interval_ms: u64,
    /// Consecutive idle checks required before regenerating
    pub idle_threshold: u32,
    /// How long to wait for the engine's frame-ready notification
    pub frame_timeout_ms: u64,
    /// Pause after a committed frame before looking for the next one
    pub between_frames_delay_ms: u64,
    /// Skip a frame after this many timeouts (None = retry forever)
    pub max_timeouts_per_frame: Option<u32>,
    /// Capacity of the frame-ready channel
    pub frame_ready_capacity: usize,
}

impl Default for PopulatorConfig {
    fn default() -> Self {
        Self {
            idle_check_interval_ms: 40,
            idle_threshold: 3,
            frame_timeout_ms: 2000,
            between_frames_delay_ms: 10,
            max_timeouts_per_frame: None,
            frame_ready_capacity: 64,
        }
    }
}

impl PopulatorConfig {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn between_frames_delay(&self) -> Duration {
        Duration::from_millis(self.between_frames_delay_ms)
    }
}

/// "Frame `time` of `image` has been rendered and staged"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    pub image: Uuid,
    pub time: i32,
}

/// Sending half handed to the render engine. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct FrameReadyNotifier {
    tx: Sender<FrameReady>,
    registry: Arc<CacheRegistry>,
}

impl FrameReadyNotifier {
    /// Announce a frame the engine has just staged. If the queue is full the
    /// notification and its staged payload are both dropped; the controller
    /// side then runs into a timeout.
    pub fn frame_ready(&self, image: Uuid, time: i32) {
        match self.tx.try_send(FrameReady { image, time }) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!("Frame-ready queue full, dropping {}:{}", msg.image, msg.time);
                if let Some(cache) = self.registry.get(msg.image) {
                    cache.discard_staged(msg.time);
                }
            }
            Err(TrySendError::Disconnected(_)) => trace!("Populator gone, frame-ready {}:{} ignored", image, time),
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulatorStats {
    pub requests: u64,
    pub commits: u64,
    pub timeouts: u64,
    pub conversion_failures: u64,
    /// Notifications that were not the in-flight request
    pub stale_notifications: u64,
    /// Frames committed from unrequested (on-demand) renders
    pub on_demand_commits: u64,
}

/// Which cache a selection pass is looking at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheRole {
    Active,
    Other,
}

struct InFlight {
    cache: Weak<FrameCache>,
    image: Uuid,
    time: i32,
}

impl InFlight {
    fn is(&self, image: Uuid, time: i32) -> bool {
        self.image == image && self.time == time
    }
}

struct ConvertedFrame {
    cache: Weak<FrameCache>,
    image: Uuid,
    time: i32,
    /// Cache generation the payload was taken at
    generation: u64,
    /// Answer to the in-flight request, as opposed to an on-demand render
    requested: bool,
    result: Result<Frame, ConversionError>,
}

pub struct CachePopulator {
    config: PopulatorConfig,
    registry: Arc<CacheRegistry>,
    host: Arc<dyn HostContext>,
    converter: Arc<dyn DisplayConverter>,
    workers: Arc<Workers>,
    emitter: EventEmitter,

    state: PopulatorState,
    idle_streak: u32,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    /// Timeouts per (image, time), reset when the image is invalidated
    timeouts: HashMap<(Uuid, i32), u32>,
    stats: PopulatorStats,

    frame_ready_tx: Sender<FrameReady>,
    frame_ready_rx: Receiver<FrameReady>,
    converted_tx: Sender<ConvertedFrame>,
    converted_rx: Receiver<ConvertedFrame>,
    changes_rx: Receiver<Uuid>,
    /// False once the event bus (and its subscription) is gone
    changes_open: bool,
}

impl CachePopulator {
    /// Build the populator and subscribe it to cache change events on `bus`.
    ///
    /// Starts in `WaitingForIdle` with the first idle check due at `now`
    /// plus one interval.
    pub fn new(
        config: PopulatorConfig,
        registry: Arc<CacheRegistry>,
        host: Arc<dyn HostContext>,
        converter: Arc<dyn DisplayConverter>,
        workers: Arc<Workers>,
        bus: &EventBus,
        now: Instant,
    ) -> Self {
        let (frame_ready_tx, frame_ready_rx) = bounded(config.frame_ready_capacity.max(1));
        let (converted_tx, converted_rx) = unbounded();
        let (changes_tx, changes_rx) = unbounded();

        bus.subscribe::<CacheChangedEvent, _>(move |event| {
            if event.may_add_work() {
                let _ = changes_tx.send(event.image);
            }
        });

        info!(
            "CachePopulator init: idle interval={}ms x{}, frame timeout={}ms, retry cap={:?}",
            config.idle_check_interval_ms, config.idle_threshold, config.frame_timeout_ms, config.max_timeouts_per_frame
        );

        let deadline = Some(now + config.idle_check_interval());
        Self {
            config,
            registry,
            host,
            converter,
            workers,
            emitter: bus.emitter(),
            state: PopulatorState::WaitingForIdle,
            idle_streak: 0,
            deadline,
            in_flight: None,
            timeouts: HashMap::new(),
            stats: PopulatorStats::default(),
            frame_ready_tx,
            frame_ready_rx,
            converted_tx,
            converted_rx,
            changes_rx,
            changes_open: true,
        }
    }

    pub fn notifier(&self) -> FrameReadyNotifier {
        FrameReadyNotifier {
            tx: self.frame_ready_tx.clone(),
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn state(&self) -> PopulatorState {
        self.state
    }

    pub fn stats(&self) -> PopulatorStats {
        self.stats
    }

    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }

    /// When the current timer fires, None if no timer is running
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// (image, time) currently being regenerated or converted
    pub fn in_flight(&self) -> Option<(Uuid, i32)> {
        self.in_flight.as_ref().map(|f| (f.image, f.time))
    }

    /// Leave `NotWaitingForAnything`. No-op in any other state.
    pub fn rearm(&mut self, now: Instant) {
        if self.state == PopulatorState::NotWaitingForAnything {
            debug!("Populator re-armed");
            self.idle_streak = 0;
            self.enter(PopulatorState::WaitingForIdle, Some(now + self.config.idle_check_interval()));
        }
    }

    /// Process queued messages, then fire the timer if it is due
    pub fn tick(&mut self, now: Instant) -> PopulatorState {
        self.drain_changes(now);

        while let Ok(msg) = self.frame_ready_rx.try_recv() {
            self.on_frame_ready(msg, now);
        }
        while let Ok(msg) = self.converted_rx.try_recv() {
            self.on_converted(msg, now);
        }

        if self.deadline.is_some_and(|d| now >= d) {
            self.deadline = None;
            match self.state {
                PopulatorState::WaitingForIdle | PopulatorState::BetweenFrames => self.check_idle(now),
                PopulatorState::WaitingForFrame => self.on_frame_timeout(now),
                PopulatorState::WaitingForConvertedFrame | PopulatorState::NotWaitingForAnything => {}
            }
        }
        self.state
    }

    /// Controller loop: sleep until the next deadline or message, then tick.
    /// Returns when `shutdown` receives a message or is disconnected.
    pub fn run(mut self, shutdown: Receiver<()>) -> PopulatorStats {
        info!("Populator controller loop started");
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            self.tick(Instant::now());

            let mut sel = Select::new();
            sel.recv(&self.frame_ready_rx);
            sel.recv(&self.converted_rx);
            if self.changes_open {
                sel.recv(&self.changes_rx);
            }
            sel.recv(&shutdown);
            match self.deadline {
                Some(deadline) => {
                    let _ = sel.ready_deadline(deadline);
                }
                None => {
                    sel.ready();
                }
            }
        }
        info!("Populator controller loop stopped: {:?}", self.stats);
        self.stats
    }

    // ========== Transitions ==========

    fn enter(&mut self, state: PopulatorState, deadline: Option<Instant>) {
        self.deadline = deadline;
        if self.state != state {
            trace!("Populator: {:?} -> {:?}", self.state, state);
            let old = self.state;
            self.state = state;
            self.emitter.emit(PopulatorStateChangedEvent { old, new: state });
        }
    }

    fn back_to_idle_wait(&mut self, now: Instant) {
        self.idle_streak = 0;
        self.enter(PopulatorState::WaitingForIdle, Some(now + self.config.idle_check_interval()));
    }

    fn drain_changes(&mut self, now: Instant) {
        let mut changed = false;
        loop {
            match self.changes_rx.try_recv() {
                Ok(image) => {
                    self.timeouts.retain(|(img, _), _| *img != image);
                    changed = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.changes_open = false;
                    break;
                }
            }
        }
        if changed {
            self.rearm(now);
        }
    }

    fn check_idle(&mut self, now: Instant) {
        if !self.host.is_idle() {
            if self.idle_streak > 0 {
                trace!("Application busy, idle streak reset");
            }
            self.back_to_idle_wait(now);
            return;
        }

        self.idle_streak = self.idle_streak.saturating_add(1);
        if self.idle_streak < self.config.idle_threshold {
            self.enter(PopulatorState::WaitingForIdle, Some(now + self.config.idle_check_interval()));
            return;
        }

        if !self.try_request_next(now) {
            debug!("No uncached frames left, populator going dormant");
            self.enter(PopulatorState::NotWaitingForAnything, None);
        }
    }

    fn try_request_next(&mut self, now: Instant) -> bool {
        let Some((cache, image, time)) = self.find_candidate() else {
            return false;
        };

        let uuid = cache.image_uuid();
        self.in_flight = Some(InFlight {
            cache: Arc::downgrade(&cache),
            image: uuid,
            time,
        });
        self.stats.requests += 1;
        self.enter(PopulatorState::WaitingForFrame, Some(now + self.config.frame_timeout()));

        debug!("Requesting regeneration of {}:{}", uuid, time);
        image.request_frame_regeneration(time, image.bounds());
        true
    }

    fn on_frame_ready(&mut self, msg: FrameReady, now: Instant) {
        let expected = self.state == PopulatorState::WaitingForFrame
            && self.in_flight.as_ref().is_some_and(|f| f.is(msg.image, msg.time));
        if !expected {
            self.stats.stale_notifications += 1;
            self.convert_unrequested(msg);
            return;
        }

        let cache = self.in_flight.as_ref().and_then(|f| f.cache.upgrade());
        let staged = cache.as_ref().and_then(|cache| cache.take_staged_for_commit(msg.time));
        let (Some(cache), Some((raw, generation))) = (cache, staged) else {
            warn!("Frame-ready {}:{} without staged payload, abandoning", msg.image, msg.time);
            self.in_flight = None;
            self.back_to_idle_wait(now);
            return;
        };

        // State must say "converting" before the job can possibly report back
        self.enter(PopulatorState::WaitingForConvertedFrame, None);
        self.spawn_conversion(&cache, msg, raw, generation, true);
    }

    /// A render nobody is waiting for (on-demand fetch, abandoned request):
    /// still worth caching if its frame is missing. No state change.
    fn convert_unrequested(&mut self, msg: FrameReady) {
        let Some(cache) = self.registry.get(msg.image) else {
            trace!("Ignoring frame-ready {}:{} for a closed image", msg.image, msg.time);
            return;
        };
        if cache.frame_status(msg.time) == FrameStatus::Cached {
            cache.discard_staged(msg.time);
            return;
        }
        match cache.take_staged_for_commit(msg.time) {
            Some((raw, generation)) => {
                trace!("Converting unrequested frame {}:{}", msg.image, msg.time);
                self.spawn_conversion(&cache, msg, raw, generation, false);
            }
            None => trace!("Ignoring stale frame-ready {}:{}", msg.image, msg.time),
        }
    }

    fn spawn_conversion(&self, cache: &Arc<FrameCache>, msg: FrameReady, raw: RawFrame, generation: u64, requested: bool) {
        let converter = Arc::clone(&self.converter);
        let tx = self.converted_tx.clone();
        let cache = Arc::downgrade(cache);
        let (image, time) = (msg.image, msg.time);
        self.workers.execute(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| converter.convert(&raw)))
                .unwrap_or_else(|_| Err(ConversionError::Other("converter panicked".into())));
            let _ = tx.send(ConvertedFrame {
                cache,
                image,
                time,
                generation,
                requested,
                result,
            });
        });
    }

    fn on_converted(&mut self, msg: ConvertedFrame, now: Instant) {
        if !msg.requested {
            self.commit_unrequested(msg);
            return;
        }

        let expected = self.state == PopulatorState::WaitingForConvertedFrame
            && self.in_flight.as_ref().is_some_and(|f| f.is(msg.image, msg.time));
        if !expected {
            self.stats.stale_notifications += 1;
            trace!("Ignoring stale conversion result {}:{}", msg.image, msg.time);
            return;
        }
        self.in_flight = None;

        match msg.result {
            Ok(frame) => {
                match msg.cache.upgrade() {
                    Some(cache) => {
                        if cache.commit_if_current(msg.time, frame, msg.generation) {
                            self.stats.commits += 1;
                        }
                    }
                    None => debug!("Cache for {} dropped before commit", msg.image),
                }
                self.enter(PopulatorState::BetweenFrames, Some(now + self.config.between_frames_delay()));
            }
            Err(e) => {
                warn!("Conversion of {}:{} failed: {}", msg.image, msg.time, e);
                self.stats.conversion_failures += 1;
                self.back_to_idle_wait(now);
            }
        }
    }

    fn commit_unrequested(&mut self, msg: ConvertedFrame) {
        match msg.result {
            Ok(frame) => {
                let committed = msg
                    .cache
                    .upgrade()
                    .is_some_and(|cache| cache.commit_if_current(msg.time, frame, msg.generation));
                if committed {
                    self.stats.on_demand_commits += 1;
                }
            }
            Err(e) => {
                warn!("Conversion of unrequested frame {}:{} failed: {}", msg.image, msg.time, e);
                self.stats.conversion_failures += 1;
            }
        }
    }

    fn on_frame_timeout(&mut self, now: Instant) {
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(cache) = in_flight.cache.upgrade() {
                cache.discard_staged(in_flight.time);
            }
            self.stats.timeouts += 1;
            debug!("Timed out waiting for {}:{}", in_flight.image, in_flight.time);
            if self.config.max_timeouts_per_frame.is_some() {
                self.record_timeout(in_flight.image, in_flight.time);
            }
        }
        self.back_to_idle_wait(now);
    }

    /// Count a timeout against the retry cap. Entries of closed images go.
    fn record_timeout(&mut self, image: Uuid, time: i32) {
        let registry = &self.registry;
        self.timeouts.retain(|(img, _), _| registry.get(*img).is_some());
        *self.timeouts.entry((image, time)).or_insert(0) += 1;
    }

    // ========== Candidate selection ==========

    fn exhausted(&self, image: Uuid, time: i32) -> bool {
        match self.config.max_timeouts_per_frame {
            Some(cap) => self.timeouts.get(&(image, time)).is_some_and(|n| *n >= cap),
            None => false,
        }
    }

    /// Active cache first (minus skip range), then the rest in registry order
    fn find_candidate(&self) -> Option<(Arc<FrameCache>, Arc<dyn AnimatedImage>, i32)> {
        let active = self.host.active_image();
        let mut candidates: Vec<(CacheRole, Arc<FrameCache>)> = self
            .registry
            .caches()
            .into_iter()
            .map(|cache| {
                let role = if Some(cache.image_uuid()) == active {
                    CacheRole::Active
                } else {
                    CacheRole::Other
                };
                (role, cache)
            })
            .collect();
        // Stable: keeps registry order among the others
        candidates.sort_by_key(|(role, _)| *role != CacheRole::Active);

        for (role, cache) in candidates {
            let Some(image) = cache.image() else {
                continue;
            };
            let skip = match role {
                CacheRole::Active => self.host.skip_range(),
                CacheRole::Other => FrameSet::empty(),
            };
            if let Some(time) = self.first_uncached(&cache, image.as_ref(), &skip) {
                return Some((cache, image, time));
            }
        }
        None
    }

    fn first_uncached(&self, cache: &FrameCache, image: &dyn AnimatedImage, skip: &FrameSet) -> Option<i32> {
        let clip = image.full_clip_range();
        let Some(limit) = clip.end() else {
            warn!("Image {} reports an infinite clip range, not scanning", cache.image_uuid());
            return None;
        };

        let uuid = cache.image_uuid();
        let scan = image.frame_validity().clip(&clip);
        scan.spans()
            .iter()
            .flat_map(|span| span.frames_until(limit))
            .find(|&t| {
                !skip.contains(t) && cache.frame_status(t) == FrameStatus::Uncached && !self.exhausted(uuid, t)
            })
    }
}

impl Drop for CachePopulator {
    fn drop(&mut self) {
        if let Some((image, time)) = self.in_flight() {
            debug!("Populator dropped with {}:{} in flight", image, time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::color::SrgbConverter;
    use crate::core::test_support::{FakeHost, FakeImage};
    use crate::core::time_range::TimeRange;

    struct Rig {
        bus: EventBus,
        registry: Arc<CacheRegistry>,
        host: Arc<FakeHost>,
        populator: CachePopulator,
        t0: Instant,
    }

    fn config() -> PopulatorConfig {
        PopulatorConfig {
            idle_check_interval_ms: 10,
            idle_threshold: 3,
            frame_timeout_ms: 100,
            between_frames_delay_ms: 5,
            max_timeouts_per_frame: None,
            frame_ready_capacity: 8,
        }
    }

    fn rig_with(config: PopulatorConfig, converter: Arc<dyn DisplayConverter>) -> Rig {
        let bus = EventBus::new();
        let registry = CacheRegistry::new(bus.emitter());
        let host = FakeHost::new();
        let workers = Arc::new(Workers::new(1).unwrap());
        let t0 = Instant::now();
        let populator = CachePopulator::new(config, Arc::clone(&registry), host.clone(), converter, workers, &bus, t0);
        Rig {
            bus,
            registry,
            host,
            populator,
            t0,
        }
    }

    fn rig() -> Rig {
        rig_with(config(), Arc::new(SrgbConverter))
    }

    fn ms(t0: Instant, n: u64) -> Instant {
        t0 + Duration::from_millis(n)
    }

    /// Tick through three idle checks (10, 20, 30 ms); returns the time used
    fn reach_threshold(rig: &mut Rig) -> Instant {
        let mut at = rig.t0;
        for _ in 0..3 {
            at += Duration::from_millis(10);
            rig.populator.tick(at);
        }
        at
    }

    /// Play the engine: stage a payload and notify
    fn deliver(rig: &Rig, cache: &FrameCache, time: i32) {
        cache.stage(time, RawFrame::solid_f32(2, 2, [1.0, 0.0, 0.0, 1.0]));
        rig.populator.notifier().frame_ready(cache.image_uuid(), time);
    }

    /// Tick until the worker's conversion result has been committed
    fn wait_converted(rig: &mut Rig, mut at: Instant) -> Instant {
        let give_up = Instant::now() + Duration::from_secs(5);
        while rig.populator.state() == PopulatorState::WaitingForConvertedFrame && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(1));
            at += Duration::from_millis(1);
            rig.populator.tick(at);
        }
        at
    }

    /// Tick at a fixed time until `time` shows up in `cache`
    fn wait_committed(rig: &mut Rig, cache: &FrameCache, time: i32, at: Instant) {
        let give_up = Instant::now() + Duration::from_secs(5);
        while cache.frame_status(time) == FrameStatus::Uncached && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(1));
            rig.populator.tick(at);
        }
    }

    /// Fire the pending timer; returns its deadline
    fn advance(rig: &mut Rig) -> Instant {
        let at = rig.populator.next_deadline().unwrap();
        rig.populator.tick(at);
        at
    }

    #[test]
    fn test_idle_threshold_before_request() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let _cache = rig.registry.get_cache_for(image.clone());

        rig.populator.tick(ms(rig.t0, 10));
        rig.populator.tick(ms(rig.t0, 20));
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert!(image.requests().is_empty());

        rig.populator.tick(ms(rig.t0, 30));
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);
        assert_eq!(image.requests(), vec![0]);
    }

    #[test]
    fn test_busy_resets_streak() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let _cache = rig.registry.get_cache_for(image.clone());

        rig.populator.tick(ms(rig.t0, 10));
        rig.populator.tick(ms(rig.t0, 20));
        assert_eq!(rig.populator.idle_streak(), 2);

        rig.host.set_idle(false);
        rig.populator.tick(ms(rig.t0, 30));
        assert_eq!(rig.populator.idle_streak(), 0);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert_eq!(rig.populator.next_deadline(), Some(ms(rig.t0, 40)));
        assert!(image.requests().is_empty());
    }

    #[test]
    fn test_timer_not_due_does_nothing() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let _cache = rig.registry.get_cache_for(image.clone());

        for _ in 0..10 {
            rig.populator.tick(ms(rig.t0, 5));
        }
        assert_eq!(rig.populator.idle_streak(), 0);
    }

    #[test]
    fn test_requests_first_uncached_frame() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());
        for t in 0..=4 {
            cache.commit(t, Frame::from_rgba8(vec![0; 16], 2, 2));
        }

        reach_threshold(&mut rig);
        assert_eq!(image.requests(), vec![5]);
        assert_eq!(rig.populator.in_flight(), Some((image.uuid(), 5)));
    }

    #[test]
    fn test_full_cycle_commits_frame() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        deliver(&rig, &cache, 0);
        rig.populator.tick(at);
        let at = wait_converted(&mut rig, at);

        assert_eq!(rig.populator.state(), PopulatorState::BetweenFrames);
        assert_eq!(cache.frame_status(0), FrameStatus::Cached);
        assert_eq!(cache.fetch(0).unwrap().pixels()[..4], [255, 0, 0, 255]);
        assert_eq!(rig.populator.stats().commits, 1);
        assert!(rig.populator.in_flight().is_none());

        // Between-frames delay keeps the idle streak: next frame right after
        let next = rig.populator.next_deadline().unwrap();
        assert!(next > at);
        rig.populator.tick(next);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);
        assert_eq!(image.requests(), vec![0, 1]);
    }

    #[test]
    fn test_populates_everything_then_goes_dormant() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 2));
        let cache = rig.registry.get_cache_for(image.clone());

        let mut at = reach_threshold(&mut rig);
        for t in 0..=2 {
            assert_eq!(rig.populator.in_flight(), Some((image.uuid(), t)));
            deliver(&rig, &cache, t);
            rig.populator.tick(at);
            at = wait_converted(&mut rig, at);
            at = rig.populator.next_deadline().unwrap();
            rig.populator.tick(at);
        }

        assert_eq!(cache.cached_times(), vec![0, 1, 2]);
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);
        assert_eq!(rig.populator.next_deadline(), None);
    }

    #[test]
    fn test_invalidation_rearms_dormant_populator() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 1));
        let cache = rig.registry.get_cache_for(image.clone());
        cache.commit(0, Frame::from_rgba8(vec![0; 16], 2, 2));
        cache.commit(1, Frame::from_rgba8(vec![0; 16], 2, 2));

        let at = reach_threshold(&mut rig);
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);

        // A commit alone does not re-arm
        cache.commit(1, Frame::from_rgba8(vec![1; 16], 2, 2));
        rig.populator.tick(at + Duration::from_secs(1));
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);

        cache.invalidate(TimeRange::single(1));
        let at = at + Duration::from_secs(2);
        rig.populator.tick(at);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert_eq!(rig.populator.idle_streak(), 0);
        assert_eq!(rig.populator.next_deadline(), Some(at + Duration::from_millis(10)));
    }

    #[test]
    fn test_timeout_returns_to_idle_wait() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);

        rig.populator.tick(at + Duration::from_millis(99));
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);

        let after = at + Duration::from_millis(100);
        rig.populator.tick(after);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert_eq!(rig.populator.stats().timeouts, 1);
        assert_eq!(cache.frame_status(0), FrameStatus::Uncached);
        assert!(rig.populator.in_flight().is_none());

        // A late render for the abandoned request is still cached, without
        // disturbing the idle wait
        deliver(&rig, &cache, 0);
        let late = after + Duration::from_millis(1);
        wait_committed(&mut rig, &cache, 0, late);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert_eq!(rig.populator.stats().stale_notifications, 1);
        assert_eq!(rig.populator.stats().on_demand_commits, 1);
        assert_eq!(rig.populator.stats().commits, 0);
        assert_eq!(cache.frame_status(0), FrameStatus::Cached);
        assert_eq!(cache.staged_count(), 0);
    }

    #[test]
    fn test_mismatched_notification_keeps_request() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        deliver(&rig, &cache, 7);
        rig.populator.notifier().frame_ready(Uuid::new_v4(), 0);
        rig.populator.tick(at);

        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);
        assert_eq!(rig.populator.stats().stale_notifications, 2);
        assert_eq!(rig.populator.in_flight(), Some((image.uuid(), 0)));
        assert_eq!(cache.staged_count(), 0);

        // Frame 7 gets cached on the side; the request for 0 is still pending
        wait_committed(&mut rig, &cache, 7, at);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);
        assert_eq!(rig.populator.in_flight(), Some((image.uuid(), 0)));
        assert_eq!(cache.frame_status(0), FrameStatus::Uncached);
    }

    #[test]
    fn test_active_cache_has_priority() {
        let mut rig = rig();
        let other = FakeImage::new(TimeRange::new(0, 10));
        let active = FakeImage::new(TimeRange::new(0, 10));
        let _c_other = rig.registry.get_cache_for(other.clone());
        let _c_active = rig.registry.get_cache_for(active.clone());
        rig.host.set_active(Some(active.uuid()));

        reach_threshold(&mut rig);
        assert_eq!(active.requests(), vec![0]);
        assert!(other.requests().is_empty());
    }

    #[test]
    fn test_skip_range_only_for_active() {
        let mut rig = rig();
        let active = FakeImage::new(TimeRange::new(0, 4));
        let c_active = rig.registry.get_cache_for(active.clone());
        c_active.commit(0, Frame::from_rgba8(vec![0; 16], 2, 2));
        rig.host.set_active(Some(active.uuid()));
        rig.host.set_skip(FrameSet::from_range(TimeRange::new(1, 3)));

        reach_threshold(&mut rig);
        assert_eq!(active.requests(), vec![4]);
    }

    #[test]
    fn test_falls_back_to_other_caches() {
        let mut rig = rig();
        let active = FakeImage::new(TimeRange::new(0, 2));
        let other = FakeImage::new(TimeRange::new(0, 2));
        let _c_active = rig.registry.get_cache_for(active.clone());
        let c_other = rig.registry.get_cache_for(other.clone());
        c_other.commit(0, Frame::from_rgba8(vec![0; 16], 2, 2));
        rig.host.set_active(Some(active.uuid()));
        // everything in the active image is about to be edited
        rig.host.set_skip(FrameSet::from_range(TimeRange::infinite_from(0)));

        reach_threshold(&mut rig);
        assert!(active.requests().is_empty());
        assert_eq!(other.requests(), vec![1]);
    }

    #[test]
    fn test_scan_respects_validity() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 20));
        image.set_validity(FrameSet::from_ranges([TimeRange::new(5, 6), TimeRange::infinite_from(15)]));
        let cache = rig.registry.get_cache_for(image.clone());
        cache.commit(5, Frame::from_rgba8(vec![0; 16], 2, 2));
        cache.commit(6, Frame::from_rgba8(vec![0; 16], 2, 2));

        reach_threshold(&mut rig);
        assert_eq!(image.requests(), vec![15]);
    }

    #[test]
    fn test_no_caches_goes_dormant() {
        let mut rig = rig();
        reach_threshold(&mut rig);
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);
    }

    struct FailingConverter;

    impl DisplayConverter for FailingConverter {
        fn convert(&self, _raw: &RawFrame) -> Result<Frame, ConversionError> {
            Err(ConversionError::Other("no profile".into()))
        }
    }

    #[test]
    fn test_conversion_failure_leaves_frame_uncached() {
        let mut rig = rig_with(config(), Arc::new(FailingConverter));
        let image = FakeImage::new(TimeRange::new(0, 3));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        deliver(&rig, &cache, 0);
        rig.populator.tick(at);
        wait_converted(&mut rig, at);

        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert_eq!(rig.populator.stats().conversion_failures, 1);
        assert_eq!(cache.frame_status(0), FrameStatus::Uncached);
        assert_eq!(rig.populator.idle_streak(), 0);
    }

    #[test]
    fn test_missing_staged_payload_abandons() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let _cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        rig.populator.notifier().frame_ready(image.uuid(), 0);
        rig.populator.tick(at);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert!(rig.populator.in_flight().is_none());
    }

    #[test]
    fn test_retry_cap_skips_stuck_frame() {
        let mut cfg = config();
        cfg.max_timeouts_per_frame = Some(1);
        let mut rig = rig_with(cfg, Arc::new(SrgbConverter));
        let image = FakeImage::new(TimeRange::new(0, 3));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        let at = at + Duration::from_millis(100);
        rig.populator.tick(at); // timeout on frame 0

        let mut at = at;
        for _ in 0..3 {
            at += Duration::from_millis(10);
            rig.populator.tick(at);
        }
        assert_eq!(image.requests(), vec![0, 1]);

        // Invalidation forgets the timeout history
        cache.invalidate(TimeRange::single(0));
        rig.populator.tick(at + Duration::from_millis(100)); // timeout on frame 1
        let mut at = at + Duration::from_millis(100);
        for _ in 0..3 {
            at += Duration::from_millis(10);
            rig.populator.tick(at);
        }
        assert_eq!(image.requests(), vec![0, 1, 0]);
    }

    #[test]
    fn test_unbounded_retries_by_default() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let _cache = rig.registry.get_cache_for(image.clone());

        let mut at = reach_threshold(&mut rig);
        for _ in 0..2 {
            at += Duration::from_millis(100);
            rig.populator.tick(at); // timeout
            for _ in 0..3 {
                at += Duration::from_millis(10);
                rig.populator.tick(at);
            }
        }
        assert_eq!(image.requests(), vec![0, 0, 0]);
    }

    #[test]
    fn test_dropped_cache_skipped() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let cache = rig.registry.get_cache_for(image.clone());
        drop(cache);

        reach_threshold(&mut rig);
        assert!(image.requests().is_empty());
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);
    }

    #[test]
    fn test_state_events_published() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let _cache = rig.registry.get_cache_for(image.clone());
        rig.bus.poll();

        reach_threshold(&mut rig);
        let states: Vec<PopulatorStateChangedEvent> = rig
            .bus
            .poll()
            .iter()
            .filter_map(|e| crate::core::event_bus::downcast_event::<PopulatorStateChangedEvent>(e).copied())
            .collect();
        assert_eq!(
            states,
            vec![PopulatorStateChangedEvent {
                old: PopulatorState::WaitingForIdle,
                new: PopulatorState::WaitingForFrame,
            }]
        );
    }

    #[test]
    fn test_new_cache_wakes_dormant_populator() {
        let mut rig = rig();
        let at = reach_threshold(&mut rig);
        assert_eq!(rig.populator.state(), PopulatorState::NotWaitingForAnything);

        let image = FakeImage::new(TimeRange::new(0, 10));
        let _cache = rig.registry.get_cache_for(image.clone());
        rig.populator.tick(at + Duration::from_secs(1));
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);

        for _ in 0..3 {
            advance(&mut rig);
        }
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForFrame);
        assert_eq!(image.requests(), vec![0]);
    }

    #[test]
    fn test_fetch_render_is_cached_while_busy() {
        let mut rig = rig();
        rig.host.set_idle(false);
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());

        assert!(cache.fetch(3).is_none());
        assert_eq!(image.requests(), vec![3]);
        deliver(&rig, &cache, 3);

        let at = ms(rig.t0, 50);
        wait_committed(&mut rig, &cache, 3, at);
        rig.populator.tick(ms(rig.t0, 100));

        assert_eq!(cache.frame_status(3), FrameStatus::Cached);
        assert_eq!(cache.staged_count(), 0);
        assert_eq!(rig.populator.stats().on_demand_commits, 1);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForIdle);
        assert!(rig.populator.in_flight().is_none());
    }

    #[test]
    fn test_unrequested_render_for_cached_frame_dropped() {
        let mut rig = rig();
        rig.host.set_idle(false);
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());
        cache.commit(2, Frame::from_rgba8(vec![9; 16], 2, 2));

        deliver(&rig, &cache, 2);
        rig.populator.tick(ms(rig.t0, 1));
        assert_eq!(cache.staged_count(), 0);
        assert_eq!(cache.fetch(2).unwrap().pixels()[0], 9);
        assert_eq!(rig.populator.stats().on_demand_commits, 0);
    }

    /// Converts only after the test opens the gate
    struct GatedConverter {
        gate: Receiver<()>,
    }

    impl DisplayConverter for GatedConverter {
        fn convert(&self, raw: &RawFrame) -> Result<Frame, ConversionError> {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            SrgbConverter.convert(raw)
        }
    }

    #[test]
    fn test_conversion_outdated_by_invalidation_not_committed() {
        let (open, gate) = unbounded();
        let mut rig = rig_with(config(), Arc::new(GatedConverter { gate }));
        let image = FakeImage::new(TimeRange::new(0, 3));
        let cache = rig.registry.get_cache_for(image.clone());

        let at = reach_threshold(&mut rig);
        deliver(&rig, &cache, 0);
        rig.populator.tick(at);
        assert_eq!(rig.populator.state(), PopulatorState::WaitingForConvertedFrame);

        // Edit lands while the worker converts the old render
        cache.invalidate(TimeRange::single(0));
        open.send(()).unwrap();
        wait_converted(&mut rig, at);
        assert_eq!(rig.populator.state(), PopulatorState::BetweenFrames);
        assert_eq!(cache.frame_status(0), FrameStatus::Uncached);
        assert_eq!(rig.populator.stats().commits, 0);
    }

    #[test]
    fn test_full_queue_drops_staged_payload() {
        let mut cfg = config();
        cfg.frame_ready_capacity = 1;
        let rig = rig_with(cfg, Arc::new(SrgbConverter));
        let image = FakeImage::new(TimeRange::new(0, 10));
        let cache = rig.registry.get_cache_for(image.clone());

        deliver(&rig, &cache, 1);
        deliver(&rig, &cache, 2);
        assert_eq!(cache.staged_count(), 1);
        assert!(cache.take_staged(1).is_some());
    }

    #[test]
    fn test_timeouts_not_tracked_without_cap() {
        let mut rig = rig();
        let image = FakeImage::new(TimeRange::new(0, 3));
        let _cache = rig.registry.get_cache_for(image.clone());

        reach_threshold(&mut rig);
        advance(&mut rig); // timeout
        assert_eq!(rig.populator.stats().timeouts, 1);
        assert!(rig.populator.timeouts.is_empty());
    }

    #[test]
    fn test_timeouts_of_closed_images_pruned() {
        let mut cfg = config();
        cfg.max_timeouts_per_frame = Some(5);
        let mut rig = rig_with(cfg, Arc::new(SrgbConverter));
        let first = FakeImage::new(TimeRange::new(0, 3));
        let c_first = rig.registry.get_cache_for(first.clone());

        reach_threshold(&mut rig);
        advance(&mut rig); // timeout on first:0
        assert!(rig.populator.timeouts.contains_key(&(first.uuid(), 0)));

        drop(c_first);
        let second = FakeImage::new(TimeRange::new(0, 3));
        let _c_second = rig.registry.get_cache_for(second.clone());
        for _ in 0..3 {
            advance(&mut rig);
        }
        assert_eq!(second.requests(), vec![0]);
        advance(&mut rig); // timeout on second:0

        let keys: Vec<(Uuid, i32)> = rig.populator.timeouts.keys().copied().collect();
        assert_eq!(keys, vec![(second.uuid(), 0)]);
    }

    #[test]
    fn test_run_loop_stops_on_shutdown() {
        let rig = rig();
        let (tx, rx) = bounded(1);
        let handle = std::thread::spawn(move || rig.populator.run(rx));
        tx.send(()).unwrap();
        let stats = handle.join().unwrap();
        assert_eq!(stats, PopulatorStats::default());
    }
}
