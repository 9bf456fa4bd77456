use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info};

use weft_core::error::Result;
use weft_core::surface::SurfaceEvent;
use weft_core::traits::BrowserSurface;

use crate::plan::Watch;

struct ArmedWatch {
    watch: Watch,
    events: BoxStream<'static, SurfaceEvent>,
}

/// Watches armed by one execution loop. Dropping the set deregisters every
/// observer, so a loop that ends for any reason leaves nothing behind.
#[derive(Default)]
pub struct WatchSet {
    armed: Vec<ArmedWatch>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn arm(&mut self, surface: &Arc<dyn BrowserSurface>, watch: Watch) -> Result<()> {
        let events = surface.watch(watch.event).await?;
        info!(event = %watch.event, repeat = watch.repeat, "Watch armed");
        self.armed.push(ArmedWatch { watch, events });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Take the first firing that is already queued, without waiting.
    /// One-shot watches are disarmed as they fire; re-arming watches stay.
    pub fn poll_ready(&mut self) -> Option<(Watch, SurfaceEvent)> {
        let mut index = 0;
        while index < self.armed.len() {
            match self.armed[index].events.next().now_or_never() {
                Some(Some(event)) => return Some(self.fired(index, event)),
                Some(None) => {
                    debug!(event = %self.armed[index].watch.event, "Watch stream ended");
                    self.armed.remove(index);
                }
                None => index += 1,
            }
        }
        None
    }

    /// Wait up to `limit` for the next firing of any armed watch.
    pub async fn next_within(&mut self, limit: Duration) -> Option<(Watch, SurfaceEvent)> {
        let deadline = tokio::time::Instant::now() + limit;
        while !self.armed.is_empty() {
            let waits = self.armed.iter_mut().map(|w| w.events.next());
            let next = futures::future::select_all(waits);
            let (event, index, _) = tokio::time::timeout_at(deadline, next).await.ok()?;
            match event {
                Some(event) => return Some(self.fired(index, event)),
                None => {
                    self.armed.remove(index);
                }
            }
        }
        None
    }

    fn fired(&mut self, index: usize, event: SurfaceEvent) -> (Watch, SurfaceEvent) {
        if self.armed[index].watch.repeat {
            (self.armed[index].watch.clone(), event)
        } else {
            let done = self.armed.remove(index);
            debug!(event = %done.watch.event, "One-shot watch disarmed");
            (done.watch, event)
        }
    }

    /// Deregister every observer.
    pub fn clear(&mut self) {
        if !self.armed.is_empty() {
            debug!(count = self.armed.len(), "Watches cancelled");
        }
        self.armed.clear();
    }
}

#[cfg(test)]
mod tests {
    use weft_core::surface::WatchEvent;
    use weft_test_utils::MockSurface;

    use crate::plan::{Step, StepItem};

    use super::*;

    fn watch(repeat: bool) -> Watch {
        Watch {
            event: WatchEvent::Dom,
            repeat,
            description: "new rows".into(),
            trigger: vec![StepItem::Step(Step::new("record"))],
        }
    }

    #[tokio::test]
    async fn one_shot_watch_disarms_after_first_firing() {
        let mock = Arc::new(MockSurface::new("tab"));
        let surface: Arc<dyn BrowserSurface> = mock.clone();
        let mut set = WatchSet::new();
        set.arm(&surface, watch(false)).await.unwrap();
        assert!(set.poll_ready().is_none());

        mock.emit(WatchEvent::Dom, "row added");
        let (fired, event) = set.poll_ready().unwrap();
        assert!(!fired.repeat);
        assert_eq!(event.detail, "row added");
        assert!(set.is_empty());
        assert_eq!(mock.watcher_count(), 0);
    }

    #[tokio::test]
    async fn looping_watch_stays_armed_until_cleared() {
        let mock = Arc::new(MockSurface::new("tab"));
        let surface: Arc<dyn BrowserSurface> = mock.clone();
        let mut set = WatchSet::new();
        set.arm(&surface, watch(true)).await.unwrap();

        mock.emit(WatchEvent::Dom, "one");
        mock.emit(WatchEvent::Dom, "two");
        assert_eq!(set.poll_ready().unwrap().1.detail, "one");
        assert_eq!(set.poll_ready().unwrap().1.detail, "two");
        assert_eq!(set.len(), 1);

        set.clear();
        assert_eq!(mock.watcher_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn next_within_times_out_quietly() {
        let mock = Arc::new(MockSurface::new("tab"));
        let surface: Arc<dyn BrowserSurface> = mock.clone();
        let mut set = WatchSet::new();
        set.arm(&surface, watch(true)).await.unwrap();
        assert!(set.next_within(Duration::from_secs(2)).await.is_none());
        assert_eq!(set.len(), 1);
    }
}
