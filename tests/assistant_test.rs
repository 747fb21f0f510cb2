mod helpers;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use medimimes::assistant::knowledge::ingest_text;
use medimimes::assistant::records;
use medimimes::assistant::{Assistant, Route, GREETING_REPLY};
use medimimes::config::AssistantConfig;
use medimimes::embedding::hashed::HashedEmbeddingProvider;
use medimimes::meds::doses::log_dose;
use medimimes::meds::types::Frequency;

use helpers::*;

fn assistant(model: Arc<FakeModel>) -> Assistant {
    Assistant::new(
        Arc::new(HashedEmbeddingProvider::new()),
        model,
        &AssistantConfig::default(),
    )
}

#[test]
fn records_are_scoped_to_the_asking_user() {
    let conn = test_db();
    let asha = create_user(&conn, "asha");
    let ravi = create_user(&conn, "ravi");
    let med = add_med(&conn, asha.id, "Metformin", Frequency::Daily, &["08:00", "20:00"], at(2025, 3, 1, 7, 0));
    add_med(&conn, ravi.id, "Lisinopril", Frequency::Daily, &["09:00"], at(2025, 3, 1, 7, 0));
    log_dose(&conn, asha.id, med.id, "08:00", true, at(2025, 3, 2, 8, 3)).unwrap();
    log_dose(&conn, asha.id, med.id, "20:00", false, at(2025, 3, 2, 21, 0)).unwrap();
    let now = at(2025, 3, 3, 10, 0);

    let meds = records::answer(&conn, asha.id, "what medications am I taking", now).unwrap();
    assert!(meds.contains("Metformin"));
    assert!(!meds.contains("Lisinopril"));

    let last = records::answer(&conn, asha.id, "when was my last dose?", now).unwrap();
    assert!(last.starts_with("Your last dose: Metformin (500 mg)"), "{last}");

    let missed = records::answer(&conn, asha.id, "did I forget anything", now).unwrap();
    assert!(missed.contains("Metformin: 1 missed"), "{missed}");

    let upcoming = records::answer(&conn, asha.id, "what is my schedule", now).unwrap();
    assert!(upcoming.starts_with("Your upcoming doses:"));
    assert_eq!(upcoming.lines().count(), 6, "{upcoming}");

    let nothing = records::answer(&conn, ravi.id, "show my dose history", now).unwrap();
    assert_eq!(nothing, "No dose history yet.");
}

#[tokio::test]
async fn small_talk_skips_the_model() {
    let model = Arc::new(FakeModel::default());
    let bot = assistant(model.clone());
    let db = Arc::new(Mutex::new(test_db()));

    let reply = bot.reply(&db, 1, "Hello!", at(2025, 3, 3, 9, 0)).await;
    assert_eq!(reply.route, Route::Greeting);
    assert_eq!(reply.response, GREETING_REPLY);
    assert!(model.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn knowledge_questions_send_retrieved_context() {
    let mut conn = test_db();
    let config = AssistantConfig::default();
    ingest_text(
        &mut conn,
        &HashedEmbeddingProvider::new(),
        "missed-doses.md",
        "If you miss a dose, take it as soon as you remember unless the next dose is near.",
        &config,
        at(2025, 3, 1, 9, 0),
    )
    .unwrap();

    let model = Arc::new(FakeModel::default());
    let bot = assistant(model.clone());
    let db = Arc::new(Mutex::new(conn));

    let reply = bot
        .reply(&db, 1, "What should I do if I miss a dose?", at(2025, 3, 3, 9, 0))
        .await;
    assert_eq!(reply.route, Route::Knowledge);
    assert_eq!(reply.response, "Take it as soon as you remember.");
    assert_eq!(reply.sources, vec!["missed-doses.md".to_string()]);

    let prompts = model.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("unless the next dose is near"));
    assert!(prompts[0].ends_with("Question: What should I do if I miss a dose?\nAnswer:"));
}

#[tokio::test]
async fn model_failure_becomes_reply_text() {
    let model = Arc::new(FakeModel::default());
    model.fail.store(true, Ordering::SeqCst);
    let bot = assistant(model);
    let db = Arc::new(Mutex::new(test_db()));

    let reply = bot
        .reply(&db, 1, "side effects of ibuprofen", at(2025, 3, 3, 9, 0))
        .await;
    assert_eq!(reply.route, Route::Knowledge);
    assert!(reply.response.starts_with("Oops! Something went wrong:"), "{}", reply.response);
}
