//! Orchestrator Tests
//!
//! End-to-end behavior against a scripted collaborator: the reference-view
//! pipeline, in-flight gating, ledger-driven regeneration, timeouts and upscaling.

mod common;

use std::time::Duration;

use charsheet::{
    Activity, DispatchOutcome, EntityKey, OrchestratorConfig, PartKey, PartKind, Phase, SheetError,
    ViewKind,
};
use common::{orchestrator, png, prepared_orchestrator, Call, ScriptedCollaborator, PALETTE};

// =============================================================================
// PIPELINE
// =============================================================================

#[tokio::test]
async fn test_full_pipeline_then_parts() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new().with_initial_balance(5));
    let progress = orch.subscribe();
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();

    let report = orch.run_pipeline().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(
        report.completed,
        vec![
            Phase::CheckingInput,
            Phase::DerivingSemiSide,
            Phase::NormalizingFront,
            Phase::DerivingSideBack,
            Phase::ExtractingPalette,
        ]
    );
    assert_eq!(&collab.view_calls()[..2], &[ViewKind::SemiSide, ViewKind::Front]);
    assert_eq!(collab.view_calls().len(), 4);
    assert!((6..=8).contains(&report.palette.len()));
    assert_eq!(report.palette[0], PALETTE[0]);
    assert_eq!(progress.borrow().percent, 100);

    orch.read(|store| {
        for kind in ViewKind::ALL {
            assert!(store.view(kind).original_image.is_some(), "{} missing", kind);
        }
        let front = store.view(ViewKind::Front);
        assert_eq!(front.user_uploaded_image, Some(png("hero-front")));
        assert_eq!(front.original_image, front.generated_image);
        assert_eq!(store.color_palette().len(), 6);
    });

    let detection = orch.detect_parts().await.unwrap();
    assert!(detection.source_detected);
    assert_eq!(detection.analyzed, ViewKind::ALL.to_vec());

    let batch = orch.generate_all_parts().await;
    assert_eq!(batch.succeeded.len(), PartKind::ALL.len());
    assert!(batch.failed.is_empty());

    let face_call = collab
        .composite_calls()
        .into_iter()
        .find(|c| matches!(c, Call::Composite { label, .. } if label == "Face"))
        .unwrap();
    match face_call {
        Call::Composite { images, style, .. } => {
            assert_eq!(images, 5);
            assert_eq!(
                style.as_deref(),
                Some("Original weight = 0.5, Generated weight = 0.5")
            );
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_pipeline_context_images() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();
    orch.run_pipeline().await.unwrap();

    for call in collab.calls() {
        if let Call::View { target, has_context, .. } = call {
            assert_eq!(has_context, target != ViewKind::SemiSide, "{}", target);
        }
    }
}

#[tokio::test]
async fn test_single_view_pipeline() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new().with_single_view_mode(true));
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();

    let report = orch.run_pipeline().await.unwrap();

    assert_eq!(
        report.completed,
        vec![Phase::CheckingInput, Phase::NormalizingFront, Phase::ExtractingPalette]
    );
    assert_eq!(collab.view_calls(), vec![ViewKind::Front]);
    assert!(collab
        .calls()
        .contains(&Call::View { target: ViewKind::Front, has_context: false, modifications: vec![] }));
    orch.read(|store| assert!(store.view(ViewKind::Back).original_image.is_none()));
}

#[tokio::test]
async fn test_pipeline_failure_keeps_completed_phases() {
    let collab = ScriptedCollaborator::new();
    collab.fail_on("back");
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();

    let report = orch.run_pipeline().await.unwrap();

    let abort = report.aborted.clone().unwrap();
    assert_eq!(abort.phase, Phase::DerivingSideBack);
    assert!(abort.reason.contains("back"));
    assert!(!collab.calls().contains(&Call::Palette));
    orch.read(|store| {
        assert!(store.view(ViewKind::Front).generated_image.is_some());
        assert!(store.view(ViewKind::SemiSide).original_image.is_some());
        // Side ran concurrently with back and still landed.
        assert!(store.view(ViewKind::Side).original_image.is_some());
        assert!(store.view(ViewKind::Back).original_image.is_none());
        assert!(store.in_flight(Activity::Regenerating).is_empty());
    });
    assert!(!orch.is_pipeline_running());
}

#[tokio::test]
async fn test_palette_failure_is_not_fatal() {
    let collab = ScriptedCollaborator::new();
    collab.fail_on("palette");
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();

    let report = orch.run_pipeline().await.unwrap();

    assert!(report.is_complete());
    assert!(report.palette.is_empty());
}

#[tokio::test]
async fn test_second_pipeline_run_is_rejected() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();
    collab.hold();

    let (first, second) = tokio::join!(orch.run_pipeline(), async {
        collab.wait_for_calls(1).await;
        let second = orch.run_pipeline().await;
        collab.release(16);
        second
    });

    assert!(first.unwrap().is_complete());
    assert!(matches!(second, Err(SheetError::PipelineBusy)));
}

#[tokio::test]
async fn test_seed_front_from_prompt() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());

    let outcome = orch.seed_front_from_prompt("knight in silver armor").await.unwrap();

    assert!(outcome.is_completed());
    let seeded = png("seed:knight in silver armor");
    orch.read(|store| {
        assert_eq!(store.view(ViewKind::Front).user_uploaded_image, Some(seeded.clone()));
    });
    assert!(orch.run_pipeline().await.unwrap().is_complete());
    assert!(matches!(
        orch.seed_front_from_prompt("   ").await,
        Err(SheetError::MissingInput(_))
    ));
}

#[tokio::test]
async fn test_undone_clear_can_be_regenerated() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let front = EntityKey::from(ViewKind::Front);
    orch.update(|store| store.clear_view(ViewKind::Front)).unwrap();
    assert!(orch.read(|s| s.source_crop(&PartKind::Face.into()).is_none()));

    assert!(orch.undo(&front).unwrap());

    orch.read(|store| {
        assert_eq!(store.view(ViewKind::Front).user_uploaded_image, Some(png("hero-front")));
        assert!(store.source_crop(&PartKind::Face.into()).is_some());
    });
    assert!(orch.regenerate_view(ViewKind::Front).await.unwrap().is_completed());
}

// =============================================================================
// IN-FLIGHT GATING
// =============================================================================

#[tokio::test]
async fn test_same_part_request_is_idempotent_while_in_flight() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let face: PartKey = PartKind::Face.into();
    let before = collab.composite_calls().len();
    let start = collab.call_count();
    collab.hold();

    let (first, (second, undo)) = tokio::join!(orch.generate_part(&face), async {
        collab.wait_for_calls(start + 1).await;
        assert!(orch.read(|store| store.part(&face).unwrap().is_loading));
        let second = orch.generate_part(&face).await.unwrap();
        let undo = orch.undo(&EntityKey::Part(face.clone()));
        collab.release(1);
        (second, undo)
    });

    assert_eq!(first.unwrap(), DispatchOutcome::Completed);
    assert_eq!(second, DispatchOutcome::Skipped);
    assert!(matches!(undo, Err(SheetError::EntityBusy(_))));
    assert_eq!(collab.composite_calls().len(), before + 1);
    orch.read(|store| assert!(!store.part(&face).unwrap().is_loading));
}

#[tokio::test]
async fn test_different_parts_run_concurrently() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let face: PartKey = PartKind::Face.into();
    let hair: PartKey = PartKind::Hair.into();
    collab.hold();
    let start = collab.call_count();

    let (a, b, _) = tokio::join!(orch.generate_part(&face), orch.generate_part(&hair), async {
        collab.wait_for_calls(start + 2).await;
        assert_eq!(
            orch.read(|store| store.in_flight(Activity::Regenerating)).len(),
            2
        );
        collab.release(2);
    });

    assert!(a.unwrap().is_completed());
    assert!(b.unwrap().is_completed());
}

#[tokio::test]
async fn test_view_request_is_idempotent_while_in_flight() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();
    collab.hold();

    let (first, second) = tokio::join!(orch.regenerate_view(ViewKind::Back), async {
        collab.wait_for_calls(1).await;
        let second = orch.regenerate_view(ViewKind::Back).await.unwrap();
        collab.release(1);
        second
    });

    assert!(first.unwrap().is_completed());
    assert_eq!(second, DispatchOutcome::Skipped);
    assert_eq!(collab.view_calls(), vec![ViewKind::Back]);
}

#[tokio::test(start_paused = true)]
async fn test_hung_call_times_out_and_clears_loading() {
    let collab = ScriptedCollaborator::new();
    let config = OrchestratorConfig::new().with_call_timeout(Some(Duration::from_secs(5)));
    let orch = orchestrator(&collab, config);
    let face: PartKey = PartKind::Face.into();
    orch.update(|store| store.attach_reference(&face, png("face-ref")))
        .unwrap();
    collab.hold();

    let outcome = orch.generate_part(&face).await.unwrap();

    match outcome {
        DispatchOutcome::Failed(reason) => assert!(reason.contains("timed out"), "{}", reason),
        other => panic!("unexpected outcome {:?}", other),
    }
    orch.read(|store| {
        let sheet = store.part(&face).unwrap();
        assert!(!sheet.is_loading);
        assert!(sheet.img_url.is_none());
        assert!(store.is_idle(&EntityKey::Part(face.clone())));
    });
}

// =============================================================================
// MODIFICATION LEDGER
// =============================================================================

#[tokio::test]
async fn test_ledger_edits_drive_regeneration() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let key = EntityKey::from(PartKind::Upper);

    let (m1, _) = orch.add_modification(&key, "add a red sash", None).await.unwrap();
    let (m2, outcome) = orch
        .add_modification(&key, "", Some(png("sash-ref")))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let last = collab.composite_calls().pop().unwrap();
    assert!(matches!(
        &last,
        Call::Composite { modifications, .. } if modifications == &["add a red sash".to_string(), String::new()]
    ));

    orch.remove_modification(&key, m1.id).await.unwrap();
    let last = collab.composite_calls().pop().unwrap();
    assert!(matches!(
        &last,
        Call::Composite { modifications, .. } if modifications.len() == 1
    ));
    orch.read(|store| {
        let ledger = store.modifications(&key).unwrap();
        assert_eq!(ledger.entries()[0].id, m2.id);
        assert_eq!(
            store.part(&PartKind::Upper.into()).unwrap().img_url,
            Some(png("sheet:upper:1"))
        );
    });

    // One undo step per ledger edit.
    assert!(orch.undo(&key).unwrap());
    assert_eq!(orch.read(|s| s.modifications(&key).unwrap().len()), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ledger_edit_request_survives_concurrent_undo() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let hair = EntityKey::from(PartKind::Hair);

    for round in 0..40 {
        let prompt = format!("braid style {}", round);
        let undoer = {
            let orch = orch.clone();
            let hair = hair.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                let _ = orch.undo(&hair);
            })
        };
        let (_, outcome) = orch.add_modification(&hair, prompt.clone(), None).await.unwrap();
        undoer.await.unwrap();

        assert!(outcome.is_completed());
        let sent = collab.composite_calls().pop().unwrap();
        assert!(matches!(
            &sent,
            Call::Composite { label, modifications, .. }
                if label == "Hair" && modifications.last() == Some(&prompt)
        ));
    }
}

#[tokio::test]
async fn test_view_ledger_regenerates_view() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let key = EntityKey::from(ViewKind::Side);

    let (_, outcome) = orch.add_modification(&key, "hood down", None).await.unwrap();

    assert!(outcome.is_completed());
    assert!(collab.calls().contains(&Call::View {
        target: ViewKind::Side,
        has_context: true,
        modifications: vec!["hood down".to_string()],
    }));
    orch.read(|store| {
        assert_eq!(
            store.view(ViewKind::Side).original_image,
            Some(png("view:side:1"))
        );
        assert!(store.view(ViewKind::Side).user_uploaded_image.is_none());
    });
}

#[tokio::test]
async fn test_ledger_edit_supersedes_in_flight_request() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let face: PartKey = PartKind::Face.into();
    let key = EntityKey::Part(face.clone());
    collab.hold();
    let start = collab.call_count();

    let (first, edit) = tokio::join!(orch.generate_part(&face), async {
        collab.wait_for_calls(start + 1).await;
        let edit = orch.add_modification(&key, "add a scar", None);
        let release = async {
            collab.wait_for_calls(start + 2).await;
            collab.release(2);
        };
        tokio::join!(edit, release).0
    });

    assert_eq!(first.unwrap(), DispatchOutcome::Superseded);
    let (_, outcome) = edit.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);
    orch.read(|store| {
        let sheet = store.part(&face).unwrap();
        assert_eq!(sheet.img_url, Some(png("sheet:face:1")));
        assert!(!sheet.is_loading);
    });
}

#[tokio::test]
async fn test_ledger_edit_without_view_source_is_rejected() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    let key = EntityKey::from(ViewKind::Back);

    let result = orch.add_modification(&key, "cape", None).await;

    assert!(matches!(result, Err(SheetError::MissingInput(_))));
    assert!(orch.read(|s| s.modifications(&key).unwrap().is_empty()));
    assert_eq!(collab.call_count(), 0);
}

// =============================================================================
// DETECTION / UPSCALE / CUSTOM PARTS
// =============================================================================

#[tokio::test]
async fn test_detection_marks_absent_parts_and_uses_custom_labels() {
    let collab = ScriptedCollaborator::new();
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();
    orch.run_pipeline().await.unwrap();
    let cape = orch.update(|store| store.add_custom_part("Cape"));

    orch.detect_parts().await.unwrap();

    assert!(collab.calls().contains(&Call::Analyze {
        custom_labels: vec!["Cape".to_string()]
    }));
    orch.read(|store| {
        let front = store.view(ViewKind::Front);
        assert!(front.parts.contains_key(&PartKey::from(PartKind::Accessories)));
        assert!(front.crop(&PartKind::Accessories.into()).is_none());
        assert!(front.crop(&PartKind::Face.into()).is_some());
        assert!(front.crop(&cape.key()).is_some());
        assert!(store.source_crop(&cape.key()).is_some());
    });

    // Undo restores the pre-detection crops.
    orch.undo(&ViewKind::Front.into()).unwrap();
    assert!(orch.read(|s| s.view(ViewKind::Front).parts.is_empty()));
}

#[tokio::test]
async fn test_failed_analysis_is_reported() {
    let collab = ScriptedCollaborator::new();
    collab.fail_on("analyze");
    let orch = orchestrator(&collab, OrchestratorConfig::new());
    orch.upload_view_image(ViewKind::Front, png("hero-front")).unwrap();

    let report = orch.detect_parts().await.unwrap();

    assert!(!report.source_detected);
    assert!(report.analyzed.is_empty());
    // The raw upload plus the only view with an image.
    assert_eq!(report.failed.len(), 2);
}

#[tokio::test]
async fn test_upscale_part_and_undo() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let hair: PartKey = PartKind::Hair.into();
    assert!(matches!(
        orch.upscale_part(&hair).await,
        Err(SheetError::MissingInput(_))
    ));

    orch.generate_part(&hair).await.unwrap();
    let sheet = orch.read(|s| s.part(&hair).unwrap().img_url.clone()).unwrap();

    let outcome = orch.upscale_part(&hair).await.unwrap();

    assert!(outcome.is_completed());
    let upscaled = orch.read(|s| s.part(&hair).unwrap().img_url.clone()).unwrap();
    let mut expected = b"hd:".to_vec();
    expected.extend(sheet.decode().unwrap());
    assert_eq!(upscaled.decode().unwrap(), expected);
    orch.undo(&EntityKey::Part(hair.clone())).unwrap();
    assert_eq!(orch.read(|s| s.part(&hair).unwrap().img_url.clone()), Some(sheet));
}

#[tokio::test]
async fn test_upscale_failure_leaves_view_unchanged() {
    let collab = ScriptedCollaborator::new();
    collab.fail_on("upscale");
    let orch = prepared_orchestrator(&collab).await;
    let before = orch.read(|s| s.view(ViewKind::Back).original_image.clone());

    let outcome = orch.upscale_view(ViewKind::Back).await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Failed(_)));
    assert_eq!(orch.read(|s| s.view(ViewKind::Back).original_image.clone()), before);
    assert!(orch.read(|s| s.is_idle(&ViewKind::Back.into())));
}

#[tokio::test]
async fn test_removing_custom_part_discards_in_flight_result() {
    let collab = ScriptedCollaborator::new();
    let orch = prepared_orchestrator(&collab).await;
    let cape = orch.update(|store| store.add_custom_part("Cape"));
    orch.update(|store| store.attach_reference(&cape.key(), png("cape-ref")))
        .unwrap();
    collab.hold();
    let start = collab.call_count();

    let cape_key = cape.key();
    let (outcome, _) = tokio::join!(orch.generate_part(&cape_key), async {
        collab.wait_for_calls(start + 1).await;
        orch.update(|store| store.remove_custom_part(&cape.id)).unwrap();
        collab.release(1);
    });

    assert_eq!(outcome.unwrap(), DispatchOutcome::Superseded);
    orch.read(|store| {
        assert!(store.part(&cape.key()).is_none());
        assert!(store.in_flight(Activity::Regenerating).is_empty());
    });
}
