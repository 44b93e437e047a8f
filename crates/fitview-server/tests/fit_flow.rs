//! End-to-end fit lifecycle tests.
//!
//! These drive operations directly against a [`ServerState`], with a real
//! worker thread and event dispatcher, and observe the results through the
//! topic broadcast channel the way a connected client would.

#![allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]

mod common;

use std::time::Duration;

use fitview_server::Operation;
use fitview_server::ServerError;
use fitview_server::operations::{GetParametersArgs, StartFitArgs};
use fitview_server::topics::{PushEvent, PushFrame};
use fitview_types::{FitOutcome, Topic, TopicRecord};
use serde_json::{Value, json};

use common::{LINGER, config, count_topic, frames_until_done, loaded_state, loaded_state_with};

fn start(fitter_id: &str) -> Operation {
    Operation::StartFitThread(StartFitArgs {
        fitter_id: fitter_id.to_owned(),
        options: None,
    })
}

#[tokio::test]
async fn improvement_then_complete_updates_parameters_twice() {
    let (state, ids) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    let started = start("scripted").execute(&state).await.unwrap();
    assert_eq!(started["fitter_id"], "scripted");
    assert_eq!(started["num_steps"], 3);

    let frames = frames_until_done(&mut rx).await;
    assert_eq!(count_topic(&frames, Topic::UpdateParameters), 2);
    assert!(frames.iter().any(|frame| matches!(
        frame,
        PushFrame::Event { event: PushEvent::FitProgress, payload } if payload["step"] == 3
    )));

    let fit_active = state.topics.messages(Topic::FitActive, None).await;
    assert_eq!(fit_active.len(), 2);
    assert_eq!(fit_active[0].message["fitter_id"], "scripted");
    assert_eq!(fit_active[1].message, json!({}));

    let params = Operation::GetParameters(GetParametersArgs { only_fittable: true })
        .execute(&state)
        .await
        .unwrap();
    let params = params.as_array().unwrap();
    assert_eq!(params.len(), 2);
    let value_of = |id: fitview_types::ParameterId| {
        params
            .iter()
            .find(|p| p["id"] == json!(id))
            .map(|p| p["value_str"].clone())
            .unwrap()
    };
    assert_eq!(value_of(ids.intercept), "1.23457");
    assert_eq!(value_of(ids.slope), "2");

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["outcome"]["status"], "completed");
    assert_eq!(status["last_result"]["steps"], 3);

    let convergence = Operation::GetConvergence.execute(&state).await.unwrap();
    assert_eq!(convergence.as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn stop_before_any_start_publishes_nothing() {
    let (state, _) = loaded_state().await;
    let (replay, mut rx) = state.topics.connect().await;
    assert!(replay.is_empty());

    let stopped = Operation::StopFit.execute(&state).await.unwrap();
    assert_eq!(stopped, Value::Bool(false));
    let stopped = Operation::StopFit.execute(&state).await.unwrap();
    assert_eq!(stopped, Value::Bool(false));

    assert!(rx.try_recv().is_err());
    for topic in Topic::ALL {
        assert!(state.topics.messages(topic, None).await.is_empty());
    }
}

#[tokio::test]
async fn second_start_is_rejected_and_first_job_survives() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    let first = start("endless").execute(&state).await.unwrap();
    let err = start("scripted").execute(&state).await.unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning));

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"]["job_id"], first["job_id"]);
    assert_eq!(status["active"]["fitter_id"], "endless");
    assert_eq!(status["active"]["stopping"], false);

    // The running job keeps reporting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(Operation::StopFit.execute(&state).await.unwrap(), Value::Bool(true));
    assert_eq!(Operation::StopFit.execute(&state).await.unwrap(), Value::Bool(false));

    let frames = frames_until_done(&mut rx).await;
    assert!(frames.iter().any(|frame| matches!(
        frame,
        PushFrame::Event { event: PushEvent::FitProgress, .. }
    )));
    let logs = state.topics.messages(Topic::Log, None).await;
    assert!(logs.iter().any(|record| {
        record.message["message"]
            .as_str()
            .is_some_and(|m| m.starts_with("Can't start fit"))
    }));

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["job_id"], first["job_id"]);
    assert_eq!(status["last_result"]["outcome"]["status"], "aborted");
    let summary: FitOutcome =
        serde_json::from_value(status["last_result"]["outcome"].clone()).unwrap();
    assert_eq!(summary, FitOutcome::Aborted);
}

#[tokio::test]
async fn parameter_edits_are_rejected_while_fitting() {
    let (state, ids) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;
    start("endless").execute(&state).await.unwrap();

    let edit = Operation::parse(
        "set_parameter",
        json!({ "parameter_id": ids.slope, "property": "value", "value": 3 }),
    )
    .unwrap();
    let err = edit.execute(&state).await.unwrap_err();
    assert!(matches!(err, ServerError::FitActive));

    Operation::StopFit.execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;
}

#[tokio::test]
async fn builtin_fitter_converges_on_line() {
    let (state, ids) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    let args = StartFitArgs {
        fitter_id: "amoeba".to_owned(),
        options: Some(
            [("steps".to_owned(), json!(2000)), ("seed".to_owned(), json!(11))]
                .into_iter()
                .collect(),
        ),
    };
    Operation::StartFitThread(args).execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;

    let problem = state.problem.read().await;
    let problem = &problem.as_ref().unwrap().problem;
    let intercept = problem.parameter(ids.intercept).unwrap().value;
    let slope = problem.parameter(ids.slope).unwrap().value;
    assert!((intercept - 1.0).abs() < 1e-2, "intercept {intercept}");
    assert!((slope - 2.0).abs() < 1e-2, "slope {slope}");
}

#[tokio::test]
async fn population_fit_publishes_uncertainty() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;
    assert_eq!(
        Operation::GetUncertainty.execute(&state).await.unwrap(),
        Value::Null
    );

    let args = StartFitArgs {
        fitter_id: "de".to_owned(),
        options: Some(
            [("steps".to_owned(), json!(30)), ("seed".to_owned(), json!(5))]
                .into_iter()
                .collect(),
        ),
    };
    Operation::StartFitThread(args).execute(&state).await.unwrap();
    let frames = frames_until_done(&mut rx).await;
    assert!(count_topic(&frames, Topic::UncertaintyUpdate) >= 1);

    let summary = Operation::GetUncertainty.execute(&state).await.unwrap();
    assert_eq!(summary["labels"], json!(["intercept", "slope"]));
    assert_eq!(summary["mean"].as_array().map(Vec::len), Some(2));
    assert!(summary["samples"].as_u64().unwrap() >= 2);

    let latest = state.topics.messages(Topic::UncertaintyUpdate, Some(1)).await;
    assert_eq!(latest[0].message, Value::Bool(true));
}

fn has_log(logs: &[TopicRecord], field: &str, text: &str) -> bool {
    logs.iter()
        .any(|record| record.message[field].as_str().is_some_and(|m| m.starts_with(text)))
}

fn fitted_values(params: &Value) -> Vec<Value> {
    params
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["value_str"].clone())
        .collect()
}

#[tokio::test]
async fn failing_step_reports_failure_without_applying_point() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    start("faulty").execute(&state).await.unwrap();
    let frames = frames_until_done(&mut rx).await;
    assert_eq!(count_topic(&frames, Topic::UpdateParameters), 0);

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["outcome"]["status"], "failed");
    assert!(
        status["last_result"]["outcome"]["reason"]
            .as_str()
            .unwrap()
            .contains("objective went to nan")
    );
    assert_eq!(status["last_result"]["steps"], 0);

    let params = Operation::GetParameters(GetParametersArgs { only_fittable: true })
        .execute(&state)
        .await
        .unwrap();
    assert_eq!(fitted_values(&params), [json!("0"), json!("0")]);

    let logs = state.topics.messages(Topic::Log, None).await;
    assert!(has_log(&logs, "title", "fit failed: faulty"));
    assert!(!has_log(&logs, "title", "done with chisq"));
}

#[tokio::test]
async fn fitter_that_cannot_start_frees_the_slot() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    start("unstartable").execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["outcome"]["status"], "failed");
    assert_eq!(status["last_result"]["steps"], 0);
    let logs = state.topics.messages(Topic::Log, None).await;
    assert!(has_log(&logs, "message", "invalid option steps"));

    // The next fit runs normally.
    start("scripted").execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;
    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["last_result"]["outcome"]["status"], "completed");
}

#[tokio::test]
async fn panicking_fitter_fails_the_job_and_server_recovers() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    start("panicky").execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;

    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["outcome"]["status"], "failed");
    assert!(
        status["last_result"]["outcome"]["reason"]
            .as_str()
            .unwrap()
            .contains("panicky fitter gave up")
    );

    start("scripted").execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;
    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["last_result"]["outcome"]["status"], "completed");
}

#[tokio::test]
async fn join_timeout_is_logged_and_server_keeps_running() {
    let mut config = config();
    config.fit.join_timeout_ms = 20;
    let (state, _) = loaded_state_with(config).await;
    let (_, mut rx) = state.topics.connect().await;

    start("lingering").execute(&state).await.unwrap();
    frames_until_done(&mut rx).await;

    let logs = state.topics.messages(Topic::Log, None).await;
    assert!(has_log(&logs, "message", "fit thread failed to complete"));
    let status = Operation::GetFitStatus.execute(&state).await.unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["outcome"]["status"], "completed");

    start("scripted").execute(&state).await.unwrap();
    let frames = frames_until_done(&mut rx).await;
    assert_eq!(count_topic(&frames, Topic::UpdateParameters), 2);
}

#[tokio::test]
async fn fit_status_answers_while_worker_is_being_joined() {
    let (state, _) = loaded_state().await;
    let (_, mut rx) = state.topics.connect().await;

    start("lingering").execute(&state).await.unwrap();
    // Wait for the slot to be released; the worker is still in its drop.
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(
            &frame,
            PushFrame::Topic { topic: Topic::FitActive, contents } if contents.message == json!({})
        ) {
            break;
        }
    }

    let status = tokio::time::timeout(LINGER / 3, Operation::GetFitStatus.execute(&state))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status["active"], Value::Null);
    assert_eq!(status["last_result"]["fitter_id"], "lingering");

    frames_until_done(&mut rx).await;
    let logs = state.topics.messages(Topic::Log, None).await;
    assert!(!has_log(&logs, "message", "fit thread failed to complete"));
}
