#[cfg(test)]
mod tests {
    use crate::alerts::{AlertEngine, DEFAULT_COOLDOWN_MS};
    use crate::buffer::{DeviceAnalysisState, DeviceRegistry};
    use crate::detector::{FallDetector, NoFallReason};
    use crate::error::AppError;
    use crate::model::{
        AlertRule, EmergencyRequest, ImuSample, ReadingBatch, RealtimeEvent, VitalFlags, G,
    };
    use crate::monitor::{Monitor, EMERGENCY_NOTE};
    use crate::testing::{
        synthetic_fall, MemoryAlertStore, MemoryReadingStore, RecordingMailer, StubPredictor,
    };
    use crate::vitals::VitalsEvaluator;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const WINDOW: usize = 100;
    const DETECTOR_WINDOW: usize = 50;

    fn upright() -> ImuSample {
        ImuSample::new([0.0, 0.0, G], [0.5, 0.2, 0.1])
    }

    struct Rig {
        monitor: Monitor,
        alerts: Arc<MemoryAlertStore>,
        readings: Arc<MemoryReadingStore>,
        mailer: Arc<RecordingMailer>,
        predictor: Arc<StubPredictor>,
    }

    fn rig(mailer: RecordingMailer, predictor: StubPredictor) -> Rig {
        rig_with(mailer, predictor, MemoryReadingStore::default())
    }

    fn rig_with(mailer: RecordingMailer, predictor: StubPredictor, readings: MemoryReadingStore) -> Rig {
        let alerts = Arc::new(MemoryAlertStore::default());
        let readings = Arc::new(readings);
        let mailer = Arc::new(mailer);
        let predictor = Arc::new(predictor);
        let engine = AlertEngine::new(
            alerts.clone(),
            mailer.clone(),
            vec!["carer@example.org".into()],
            DEFAULT_COOLDOWN_MS,
        );
        let (tx, _rx) = broadcast::channel(16);
        let monitor = Monitor::new(
            DeviceRegistry::new(WINDOW, DETECTOR_WINDOW, 64, Duration::from_secs(3600)),
            FallDetector::default(),
            VitalsEvaluator::default(),
            engine,
            readings.clone(),
            predictor.clone(),
            tx,
            0.7,
        );
        Rig { monitor, alerts, readings, mailer, predictor }
    }

    fn batch(device: &str, hr: f64, spo2: f64, imu: Vec<ImuSample>) -> ReadingBatch {
        ReadingBatch {
            device_id: device.to_string(),
            ts: 1_700_000_000_000,
            hr: Some(hr),
            spo2: Some(spo2),
            flags: None,
            imu: Some(imu),
        }
    }

    // Scenario: a long stream never grows the window past its capacity
    #[test]
    fn window_stays_bounded_and_chronological() {
        let mut state = DeviceAnalysisState::new(WINDOW, DETECTOR_WINDOW);
        for i in 0..(WINDOW * 3 + 7) {
            state.push(ImuSample::new([i as f64, 0.0, G], [0.0; 3]));
        }
        let window = state.latest_window();
        assert_eq!(window.len(), WINDOW);
        assert_eq!(window[0].ax, (WINDOW * 2 + 7) as f64);
        assert_eq!(window[WINDOW - 1].ax, (WINDOW * 3 + 6) as f64);
        assert_eq!(state.samples_seen(), (WINDOW * 3 + 7) as u64);
    }

    // Scenario: warming up until the detector window fills, never after
    #[test]
    fn warm_up_is_monotonic() {
        let detector = FallDetector::default();
        let mut state = DeviceAnalysisState::new(WINDOW, DETECTOR_WINDOW);
        assert_eq!(state.detector_capacity(), detector.config().window_samples());
        for n in 1..=(DETECTOR_WINDOW * 2) {
            state.push(upright());
            let verdict = detector.classify(&state);
            assert!(!verdict.fall);
            if n < DETECTOR_WINDOW {
                assert_eq!(verdict.reason, Some(NoFallReason::WarmingUp), "n = {}", n);
            } else {
                assert_ne!(verdict.reason, Some(NoFallReason::WarmingUp), "n = {}", n);
            }
        }
    }

    // Scenario: steady 1 g is never a fall
    #[test]
    fn resting_at_one_g_is_not_a_fall() {
        let detector = FallDetector::default();
        let mut state = DeviceAnalysisState::new(WINDOW, DETECTOR_WINDOW);
        state.extend(&vec![upright(); WINDOW]);
        let verdict = detector.classify(&state);
        assert!(!verdict.fall);
        assert_eq!(verdict.reason, Some(NoFallReason::NoImpact));
    }

    // Scenario: free fall, impact, then lying tilted and still
    #[test]
    fn synthetic_fall_is_detected_through_the_registry() {
        let detector = FallDetector::default();
        let registry = DeviceRegistry::new(WINDOW, DETECTOR_WINDOW, 8, Duration::from_secs(60));
        registry.push("dev-1", &synthetic_fall());
        let verdict = registry.inspect("dev-1", |st| detector.classify(st)).unwrap();
        assert!(verdict.fall, "{:?}", verdict);
        let stats = verdict.stats.unwrap();
        assert!(stats.max_acc >= 3.0 * G);
        assert!(stats.delta_orient >= 45.0);

        registry.push("dev-2", &vec![upright(); 60]);
        let other = registry.inspect("dev-2", |st| detector.classify(st)).unwrap();
        assert!(!other.fall);
    }

    #[test]
    fn classification_is_idempotent() {
        let detector = FallDetector::default();
        let mut state = DeviceAnalysisState::new(WINDOW, DETECTOR_WINDOW);
        state.extend(&synthetic_fall());
        let first = detector.classify(&state);
        let second = detector.classify(&state);
        assert_eq!(first, second);
        assert_eq!(state.samples_seen(), 71);
    }

    #[tokio::test]
    async fn repeated_fall_batches_raise_one_alert() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));

        let first = r.monitor.ingest(batch("dev-1", 75.0, 97.0, synthetic_fall())).await.unwrap();
        assert!(first.ok);
        assert!(first.fall.as_ref().unwrap().fall);
        assert_eq!(first.alerts.len(), 1);
        assert!(!first.alerts[0].deduped);

        let again = r.monitor.ingest(batch("dev-1", 75.0, 97.0, synthetic_fall())).await.unwrap();
        assert!(again.alerts.iter().all(|a| a.deduped));

        let stored = r.alerts.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule, AlertRule::Fall);
        assert_eq!(stored[0].meta.source.as_deref(), Some("rule"));
        assert!(stored[0].value.unwrap() >= 3.0);
        assert_eq!(r.mailer.sent().len(), 1);
        assert_eq!(r.readings.imu.lock().len(), 142);
    }

    // Scenario: one long batch whose impact has left the detector window by
    // the time the batch ends
    #[tokio::test]
    async fn fall_early_in_a_long_batch_is_caught() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let mut samples = synthetic_fall();
        let lying = samples[samples.len() - 1];
        let still_lying = WINDOW - samples.len();
        samples.extend(vec![lying; still_lying]);
        assert_eq!(samples.len(), WINDOW);

        let out = r.monitor.ingest(batch("dev-12", 75.0, 97.0, samples)).await.unwrap();

        let verdict = out.fall.unwrap();
        assert!(verdict.fall, "{:?}", verdict);
        assert!(verdict.stats.unwrap().max_acc >= 3.0 * G);
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(r.alerts.all().len(), 1);
        assert_eq!(r.alerts.all()[0].rule, AlertRule::Fall);

        // the final window alone no longer shows the impact
        let detector = FallDetector::default();
        let last = r.monitor.registry().inspect("dev-12", |st| detector.classify(st)).unwrap();
        assert!(!last.fall);
    }

    #[tokio::test]
    async fn failed_imu_insert_leaves_window_untouched() {
        let r = rig_with(
            RecordingMailer::default(),
            StubPredictor::returning(0.1),
            MemoryReadingStore::failing_imu(),
        );
        let err = r.monitor.ingest(batch("dev-13", 70.0, 97.0, vec![upright(); 10])).await.unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
        assert!(r.monitor.registry().latest_window("dev-13").is_empty());
        assert!(r.monitor.registry().is_empty());
    }

    #[tokio::test]
    async fn abnormal_vitals_raise_threshold_alerts() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let out = r.monitor.ingest(batch("dev-2", 40.0, 85.0, Vec::new())).await.unwrap();

        assert!(out.fall.is_none());
        assert_eq!(out.alerts.len(), 2);
        let mut rules: Vec<_> = r.alerts.all().iter().map(|a| a.rule).collect();
        rules.sort();
        assert_eq!(rules, vec![AlertRule::HrLow, AlertRule::Spo2Low]);
        assert_eq!(r.readings.readings.lock()[0].1.hr, 40.0);
    }

    #[tokio::test]
    async fn device_flags_alone_raise_alerts() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let mut b = batch("dev-3", 80.0, 97.0, Vec::new());
        b.flags = Some(VitalFlags { hr_low: false, hr_high: true, spo2_low: false });
        let out = r.monitor.ingest(b).await.unwrap();
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(r.alerts.all()[0].rule, AlertRule::HrHigh);
    }

    #[tokio::test]
    async fn delivery_failure_does_not_fail_ingest() {
        let r = rig(RecordingMailer::failing("smtp down"), StubPredictor::returning(0.1));
        let out = r.monitor.ingest(batch("dev-4", 40.0, 97.0, Vec::new())).await.unwrap();

        assert!(out.ok);
        assert_eq!(out.delivery_failures, 1);
        assert!(!out.alerts[0].ok);
        let stored = r.alerts.get(out.alerts[0].id).unwrap();
        assert_eq!(stored.email.error.as_deref(), Some("smtp transport: smtp down"));
    }

    #[tokio::test]
    async fn blank_device_id_is_rejected() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let err = r.monitor.ingest(batch("  ", 70.0, 97.0, Vec::new())).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(r.readings.readings.lock().is_empty());
    }

    #[tokio::test]
    async fn readings_are_broadcast_to_subscribers() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let mut rx = r.monitor.subscribe();
        r.monitor.ingest(batch("dev-5", 70.0, 97.0, vec![upright(); 5])).await.unwrap();

        match rx.recv().await.unwrap() {
            RealtimeEvent::Reading { device_id, hr, spo2, .. } => {
                assert_eq!(device_id, "dev-5");
                assert_eq!((hr, spo2), (70.0, 97.0));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn evaluate_waits_for_a_full_window() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.9));
        r.monitor.ingest(batch("dev-6", 70.0, 97.0, vec![upright(); WINDOW - 1])).await.unwrap();

        let eval = r.monitor.evaluate("dev-6").await.unwrap();
        assert!(!eval.ready);
        assert!(!r.monitor.evaluate("unknown").await.unwrap().ready);
        assert_eq!(*r.predictor.calls.lock(), 0);
    }

    #[tokio::test]
    async fn confident_model_raises_fall_alert() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.92));
        let mut rx = r.monitor.subscribe();
        r.monitor.registry().push("dev-7", &vec![upright(); WINDOW]);

        let eval = r.monitor.evaluate("dev-7").await.unwrap();
        assert!(eval.ready && eval.is_fall);
        assert_eq!(eval.fall_prob, Some(0.92));
        assert!(!eval.rule.as_ref().unwrap().fall);
        assert!(eval.alert.unwrap().ok);

        let stored = r.alerts.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].meta.source.as_deref(), Some("ml"));
        assert_eq!(r.readings.inferences.lock()[0].model_version, "v1");
        assert!(matches!(rx.recv().await.unwrap(), RealtimeEvent::Inference { is_fall: true, .. }));
    }

    #[tokio::test]
    async fn unconfident_model_on_quiet_window_raises_nothing() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.7));
        r.monitor.registry().push("dev-8", &vec![upright(); WINDOW]);

        let eval = r.monitor.evaluate("dev-8").await.unwrap();
        assert!(eval.ready && !eval.is_fall);
        assert!(eval.alert.is_none());
        assert!(r.alerts.all().is_empty());
        assert_eq!(r.readings.inferences.lock().len(), 1);
    }

    #[tokio::test]
    async fn model_outage_still_raises_rule_alert() {
        let r = rig(RecordingMailer::default(), StubPredictor::unavailable());
        let mut samples = vec![upright(); WINDOW - 71];
        samples.extend(synthetic_fall());
        r.monitor.registry().push("dev-9", &samples);

        let err = r.monitor.evaluate("dev-9").await.unwrap_err();
        assert!(matches!(err, AppError::Inference(_)));

        let stored = r.alerts.all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule, AlertRule::Fall);
        assert_eq!(stored[0].meta.source.as_deref(), Some("rule"));
        assert!(r.readings.inferences.lock().is_empty());
    }

    #[tokio::test]
    async fn every_emergency_press_is_delivered() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let press = || EmergencyRequest {
            device_id: "dev-10".into(),
            ts: 1_700_000_000_000,
            note: None,
        };

        let first = r.monitor.emergency(press()).await.unwrap();
        assert!(first.ok && !first.deduped);
        let second = r.monitor.emergency(press()).await.unwrap();
        assert!(second.ok && !second.deduped);
        assert_ne!(second.id, first.id);

        let alert = r.alerts.get(first.id).unwrap();
        assert_eq!(alert.meta.note.as_deref(), Some(EMERGENCY_NOTE));
        assert_eq!(alert.meta.source.as_deref(), Some("button"));
        assert_eq!(r.mailer.sent().len(), 2);
    }

    // Scenario: the wearer falls, is auto-alerted, then presses the button
    #[tokio::test]
    async fn button_press_after_detected_fall_is_delivered() {
        let r = rig(RecordingMailer::default(), StubPredictor::returning(0.1));
        let fell = r.monitor.ingest(batch("dev-14", 75.0, 97.0, synthetic_fall())).await.unwrap();
        assert_eq!(fell.alerts.len(), 1);

        let pressed = r
            .monitor
            .emergency(EmergencyRequest { device_id: "dev-14".into(), ts: 1_700_000_000_500, note: None })
            .await
            .unwrap();
        assert!(pressed.ok && !pressed.deduped);
        assert_ne!(pressed.id, fell.alerts[0].id);
        assert_eq!(r.alerts.all().len(), 2);
        assert_eq!(r.mailer.sent().len(), 2);
    }

    #[tokio::test]
    async fn emergency_delivery_failure_reaches_the_caller() {
        let r = rig(RecordingMailer::failing("smtp down"), StubPredictor::returning(0.1));
        let err = r
            .monitor
            .emergency(EmergencyRequest { device_id: "dev-11".into(), ts: 0, note: None })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Delivery { .. }));
        assert_eq!(r.alerts.all().len(), 1);
    }
}
