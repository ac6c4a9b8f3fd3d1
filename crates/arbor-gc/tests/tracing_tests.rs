//! Spans and events emitted with the `tracing` feature.

#![cfg(feature = "tracing")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_gc::{Collector, Gc, GcConfig, GcReason, StackState, SweepKind};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

#[derive(Clone, Default)]
struct Recorder {
    spans: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Vec<String>>>,
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.spans
            .lock()
            .unwrap()
            .push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.events.lock().unwrap().push(message);
        }
    }
}

fn record(f: impl FnOnce()) -> Recorder {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    tracing::subscriber::with_default(subscriber, f);
    recorder
}

#[test]
fn test_collection_opens_cycle_and_phase_spans() {
    let recorder = record(|| {
        let collector = Collector::new(GcConfig::default().without_heuristics());
        let thread = collector.attach_current_thread();
        let _ = Gc::new(1_u64);
        thread.collect_garbage(
            StackState::NoHeapPointersOnStack,
            SweepKind::Eager,
            GcReason::ForcedGc,
        );
    });

    let spans = recorder.spans.lock().unwrap().clone();
    assert_eq!(
        spans,
        ["gc_collect", "gc_phase", "gc_phase", "gc_phase", "gc_phase"]
    );
    let events = recorder.events.lock().unwrap().clone();
    for expected in [
        "thread_attach",
        "marking_done",
        "orphaned_pages_decommitted",
        "sweep_done",
    ] {
        assert!(
            events.iter().any(|event| event == expected),
            "missing {expected} in {events:?}"
        );
    }
}

#[test]
fn test_abandoned_collection_warns_without_spans() {
    let recorder = record(|| {
        let collector = Collector::new(
            GcConfig::default()
                .without_heuristics()
                .with_park_timeout(Duration::from_millis(20)),
        );
        let thread = collector.attach_current_thread();
        let (attached_tx, attached_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let other = {
            let collector = collector.clone();
            std::thread::spawn(move || {
                let _thread = collector.attach_current_thread();
                attached_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        attached_rx.recv().unwrap();
        let outcome = thread.collect_garbage(
            StackState::NoHeapPointersOnStack,
            SweepKind::Eager,
            GcReason::ForcedGc,
        );
        assert!(!outcome.is_completed());
        release_tx.send(()).unwrap();
        other.join().unwrap();
    });

    assert!(recorder.spans.lock().unwrap().is_empty());
    assert!(recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|event| event == "park_timeout_collection_abandoned"));
}
