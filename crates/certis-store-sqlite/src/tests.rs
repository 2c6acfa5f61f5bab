//! Integration tests for the repositories against SQLite databases.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use certis_core::{
  catalog::{
    Block, NewBlock, NewQuestion, NewReferential, NewTheme, Question,
    QuestionType, QuestionUpdate, Referential, Theme,
  },
  device::{DeviceKitUpdate, GLOBAL_KIT_NAME, NewDeviceKit, NewVotingDevice, VotingDevice},
  participant::{AssignmentStatus, NewParticipant, NewParticipantAssignment, Participant},
  result::{Answer, NewSessionResult, SessionResultUpdate},
  scoring::{Thresholds, session_stats},
  session::{
    ExpectedIssue, ExpectedIssueAction, ImportAnomalies, IterationStatus,
    NewSession, NewSessionIteration, QuestionMapping, Session, SessionIteration,
    SessionStatus, SessionUpdate, UnknownDevice, UnknownDeviceAction,
  },
  trainer::NewTrainer,
};

use crate::{
  Database, Error,
  schema::{self, Migration},
  sessions::Finalization,
};

async fn db() -> Database {
  Database::open_in_memory().await.expect("in-memory database")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn referential(db: &Database, code: &str) -> Referential {
  db.catalog()
    .add_referential(NewReferential { code: code.into(), label: None })
    .await
    .unwrap()
}

async fn theme(db: &Database, code: &str, referential_id: i64) -> Theme {
  db.catalog()
    .add_theme(NewTheme { code: code.into(), label: None, referential_id })
    .await
    .unwrap()
}

async fn block(db: &Database, code: &str, theme_id: i64) -> Block {
  db.catalog()
    .add_block(NewBlock { code: code.into(), label: None, theme_id })
    .await
    .unwrap()
}

fn new_question(block_id: Option<i64>, text: &str) -> NewQuestion {
  NewQuestion::new(
    block_id,
    text,
    QuestionType::SingleChoice,
    vec!["A".into(), "B".into(), "C".into()],
    "A",
  )
}

async fn question(db: &Database, block_id: Option<i64>, text: &str) -> Question {
  db.catalog().add_question(new_question(block_id, text)).await.unwrap()
}

/// A session with one iteration attended by two participants holding
/// devices `1001` and `1002`.
struct Attendance {
  session:      Session,
  iteration:    SessionIteration,
  participants: Vec<Participant>,
  devices:      Vec<VotingDevice>,
}

async fn attendance(db: &Database) -> Attendance {
  let devices = vec![
    db.devices()
      .add_voting_device(NewVotingDevice::new("Pad 1", "1001"))
      .await
      .unwrap(),
    db.devices()
      .add_voting_device(NewVotingDevice::new("Pad 2", "1002"))
      .await
      .unwrap(),
  ];
  let kit = db
    .devices()
    .add_device_kit(NewDeviceKit { name: "Case A".into(), is_default: false })
    .await
    .unwrap();

  let session = db
    .sessions()
    .add_session(NewSession::new("CACES R489 May", date(2024, 5, 29)))
    .await
    .unwrap();
  let iteration = db
    .sessions()
    .add_or_update_session_iteration(NewSessionIteration::new(session.id, 0))
    .await
    .unwrap();

  let mut participants = Vec::new();
  for ((first, last), device) in
    [("Ada", "Lovelace"), ("Alan", "Turing")].into_iter().zip(&devices)
  {
    let p = db
      .sessions()
      .add_participant(NewParticipant::new(first, last))
      .await
      .unwrap();
    db.sessions()
      .add_participant_assignment(NewParticipantAssignment {
        session_iteration_id: iteration.id,
        participant_id:       p.id,
        voting_device_id:     device.id,
        kit_id:               kit.id,
        status:               AssignmentStatus::Present,
      })
      .await
      .unwrap();
    participants.push(p);
  }

  Attendance { session, iteration, participants, devices }
}

fn answer(
  session: &Session,
  iteration: &SessionIteration,
  question: &Question,
  serial: &str,
  is_correct: bool,
) -> NewSessionResult {
  let mut r = NewSessionResult::new(
    session.id,
    question.id,
    serial,
    is_correct,
    Utc.timestamp_millis_opt(1_717_000_000_000).unwrap(),
  );
  let choice = if is_correct { "A" } else { "B" };
  r.session_iteration_id = Some(iteration.id);
  r.answer = Some(Answer::Choice(choice.into()));
  r
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn catalog_codes_are_unique_within_their_parent() {
  let db = db().await;
  let r489 = referential(&db, "R489").await;
  let r482 = referential(&db, "R482").await;

  assert!(matches!(
    db.catalog()
      .add_referential(NewReferential { code: "R489".into(), label: None })
      .await,
    Err(Error::DuplicateKey { entity: "referential", .. })
  ));

  let a = theme(&db, "A", r489.id).await;
  theme(&db, "A", r482.id).await;
  assert!(matches!(
    db.catalog()
      .add_theme(NewTheme { code: "A".into(), label: None, referential_id: r489.id })
      .await,
    Err(Error::DuplicateKey { entity: "theme", .. })
  ));

  block(&db, "1", a.id).await;
  assert!(matches!(
    db.catalog()
      .add_block(NewBlock { code: "1".into(), label: None, theme_id: a.id })
      .await,
    Err(Error::DuplicateKey { entity: "block", .. })
  ));

  let found = db.catalog().get_theme_by_code("A", r482.id).await.unwrap().unwrap();
  assert_eq!(found.referential_id, r482.id);
  assert_eq!(db.catalog().get_all_themes().await.unwrap().len(), 2);
}

#[tokio::test]
async fn deleting_a_referential_orphans_its_questions() {
  let db = db().await;
  let r = referential(&db, "R489").await;
  let t = theme(&db, "A", r.id).await;
  let b = block(&db, "1", t.id).await;
  let q = question(&db, Some(b.id), "Which way does the load lean?").await;

  db.catalog().delete_referential(r.id).await.unwrap();

  assert!(db.catalog().get_all_themes().await.unwrap().is_empty());
  assert!(db.catalog().get_all_blocks().await.unwrap().is_empty());
  let q = db.catalog().get_question_by_id(q.id).await.unwrap().unwrap();
  assert_eq!(q.block_id, None);

  assert!(matches!(
    db.catalog().delete_referential(r.id).await,
    Err(Error::NotFound { entity: "referential", .. })
  ));
}

#[tokio::test]
async fn upsert_question_keys_on_user_question_id() {
  let db = db().await;
  let mut input = new_question(None, "First wording");
  input.user_question_id = Some("R489-A-001".into());

  let first = db.catalog().upsert_question(input.clone()).await.unwrap();
  input.text = "Second wording".into();
  let second = db.catalog().upsert_question(input).await.unwrap();

  assert_eq!(first.id, second.id);
  assert_eq!(second.text, "Second wording");
  assert_eq!(second.created_at, first.created_at);
  assert_eq!(db.catalog().question_count().await.unwrap(), 1);
}

#[tokio::test]
async fn update_question_rewrites_type_and_slide() {
  let db = db().await;
  let q = question(&db, None, "Is the load stable?").await;

  let updated = db
    .catalog()
    .update_question(q.id, QuestionUpdate {
      question_type: Some(QuestionType::TrueFalse),
      options: Some(vec!["Vrai".into(), "Faux".into()]),
      slide_guid: Some(Some("slide-7f3a".into())),
      ..QuestionUpdate::default()
    })
    .await
    .unwrap();
  assert_eq!(updated.question_type, QuestionType::TrueFalse);
  assert!(updated.updated_at.is_some());

  let stored = db.catalog().get_question_by_id(q.id).await.unwrap().unwrap();
  assert_eq!(stored.question_type, QuestionType::TrueFalse);
  assert_eq!(stored.slide_guid.as_deref(), Some("slide-7f3a"));
  assert_eq!(stored.options, ["Vrai", "Faux"]);
  assert_eq!(stored.text, "Is the load stable?");

  assert!(matches!(
    db.catalog().update_question(9_999, QuestionUpdate::default()).await,
    Err(Error::NotFound { entity: "question", .. })
  ));
}

#[tokio::test]
async fn bulk_upsert_is_all_or_nothing() {
  let db = db().await;
  let r = referential(&db, "R489").await;
  let t = theme(&db, "A", r.id).await;
  let b = block(&db, "1", t.id).await;

  let err = db
    .catalog()
    .bulk_upsert_questions(vec![
      new_question(Some(b.id), "fine"),
      new_question(Some(9_999), "points at a missing block"),
    ])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::ForeignKey { entity: "question", .. }));
  assert_eq!(db.catalog().question_count().await.unwrap(), 0);

  let stored = db
    .catalog()
    .bulk_upsert_questions(vec![
      new_question(Some(b.id), "one"),
      new_question(None, "two"),
    ])
    .await
    .unwrap();
  assert_eq!(
    stored.iter().map(|q| q.text.as_str()).collect::<Vec<_>>(),
    ["one", "two"]
  );
}

#[tokio::test]
async fn exam_questions_resolve_theme_codes() {
  let db = db().await;
  let r = referential(&db, "R489").await;
  let t = theme(&db, "A", r.id).await;
  let b = block(&db, "1", t.id).await;
  let placed = question(&db, Some(b.id), "placed").await;
  let loose = question(&db, None, "loose").await;

  let exam = db.catalog().exam_questions(&[placed.id, loose.id]).await.unwrap();
  assert_eq!(exam.len(), 2);
  assert_eq!(exam[0].theme_label, "A");
  assert_eq!(exam[0].block_id, Some(b.id));
  assert_eq!(exam[1].theme_label, certis_core::catalog::UNASSIGNED_THEME);
}

// ─── Devices and kits ────────────────────────────────────────────────────────

async fn global_members(db: &Database) -> BTreeSet<String> {
  let global = db.devices().get_global_device_kit().await.unwrap().unwrap();
  db.devices()
    .get_voting_devices_for_kit(global.id)
    .await
    .unwrap()
    .into_iter()
    .map(|d| d.serial_number)
    .collect()
}

#[tokio::test]
async fn global_kit_mirrors_the_device_table() {
  let db = db().await;
  let devices = db.devices();

  let first = devices
    .add_voting_device(NewVotingDevice::new("Pad 1", "1001"))
    .await
    .unwrap();
  devices
    .add_voting_device(NewVotingDevice::new("Pad 2", "1002"))
    .await
    .unwrap();

  let global = devices.get_global_device_kit().await.unwrap().unwrap();
  assert_eq!(global.name, GLOBAL_KIT_NAME);
  assert!(global.is_global);
  assert_eq!(global_members(&db).await, BTreeSet::from(["1001".into(), "1002".into()]));

  let inserted = devices
    .bulk_add_voting_devices(vec![
      NewVotingDevice::new("Again", "1002"),
      NewVotingDevice::new("Pad 3", "1003"),
    ])
    .await
    .unwrap();
  assert_eq!(inserted, 1);
  assert_eq!(global_members(&db).await.len(), 3);

  devices.delete_voting_device(first.id).await.unwrap();
  assert_eq!(
    global_members(&db).await,
    BTreeSet::from(["1002".into(), "1003".into()])
  );

  let kits = devices.get_all_device_kits().await.unwrap();
  assert_eq!(kits.iter().filter(|k| k.is_global).count(), 1);

  assert!(matches!(
    devices
      .add_voting_device(NewVotingDevice::new("Clone", "1003"))
      .await,
    Err(Error::DuplicateKey { entity: "voting device", .. })
  ));

  let sync = devices.reconcile_global_kit().await.unwrap();
  assert!(!sync.created);
  assert_eq!((sync.added, sync.removed), (0, 0));
}

#[tokio::test]
async fn global_kit_cannot_be_edited() {
  let db = db().await;
  let device = db
    .devices()
    .add_voting_device(NewVotingDevice::new("Pad 1", "1001"))
    .await
    .unwrap();
  let global = db.devices().get_global_device_kit().await.unwrap().unwrap();

  assert!(matches!(
    db.devices().delete_device_kit(global.id).await,
    Err(Error::ProtectedKit)
  ));
  assert!(matches!(
    db.devices().remove_device_from_kit(global.id, device.id).await,
    Err(Error::ProtectedKit)
  ));
  assert!(matches!(
    db.devices()
      .update_device_kit(global.id, DeviceKitUpdate { name: Some("Mine".into()) })
      .await,
    Err(Error::ProtectedKit)
  ));
  assert_eq!(global_members(&db).await.len(), 1);
}

#[tokio::test]
async fn fresh_database_has_a_global_kit() {
  let db = db().await;
  let global = db.devices().get_global_device_kit().await.unwrap().unwrap();
  assert_eq!(global.name, GLOBAL_KIT_NAME);
  assert!(!global.is_default);
  assert!(global_members(&db).await.is_empty());

  // Reopening the schema keeps the same kit.
  db.ensure_schema().await.unwrap();
  let kits = db.devices().get_all_device_kits().await.unwrap();
  assert_eq!(kits.len(), 1);
  assert_eq!(kits[0].id, global.id);
}

#[tokio::test]
async fn user_kit_holding_the_global_name_stays_ordinary() {
  let db = db().await;
  // A database whose user created a kit under the global kit's name before
  // kits had the global flag.
  db.connection()
    .call(|conn| {
      conn.execute_batch(
        "DELETE FROM device_kits;
         INSERT INTO device_kits (name, is_default, is_global)
           VALUES ('All devices', 1, 0);",
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let devices = db.devices();
  devices
    .add_voting_device(NewVotingDevice::new("Pad 1", "1001"))
    .await
    .unwrap();

  let kits = devices.get_all_device_kits().await.unwrap();
  let user_kit = kits.iter().find(|k| k.name == GLOBAL_KIT_NAME).unwrap();
  assert!(!user_kit.is_global);
  assert!(user_kit.is_default);
  assert!(
    devices
      .get_voting_devices_for_kit(user_kit.id)
      .await
      .unwrap()
      .is_empty()
  );

  let global = devices.get_global_device_kit().await.unwrap().unwrap();
  assert_ne!(global.id, user_kit.id);
  assert_eq!(global.name, format!("{GLOBAL_KIT_NAME} (2)"));
  assert!(!global.is_default);
  assert_eq!(global_members(&db).await, BTreeSet::from(["1001".into()]));

  devices.delete_device_kit(user_kit.id).await.unwrap();
  assert_eq!(devices.get_all_device_kits().await.unwrap().len(), 1);
}

#[tokio::test]
async fn at_most_one_default_kit() {
  let db = db().await;
  let devices = db.devices();
  let a = devices
    .add_device_kit(NewDeviceKit { name: "Case A".into(), is_default: true })
    .await
    .unwrap();
  let b = devices
    .add_device_kit(NewDeviceKit { name: "Case B".into(), is_default: true })
    .await
    .unwrap();

  assert_eq!(devices.get_default_device_kit().await.unwrap().unwrap().id, b.id);

  devices.set_default_device_kit(a.id).await.unwrap();
  let defaults: Vec<_> = devices
    .get_all_device_kits()
    .await
    .unwrap()
    .into_iter()
    .filter(|k| k.is_default)
    .collect();
  assert_eq!(defaults.len(), 1);
  assert_eq!(defaults[0].id, a.id);

  assert!(matches!(
    devices.set_default_device_kit(9_999).await,
    Err(Error::NotFound { entity: "device kit", .. })
  ));
  assert_eq!(devices.get_default_device_kit().await.unwrap().unwrap().id, a.id);
}

#[tokio::test]
async fn kit_membership_is_editable_for_ordinary_kits() {
  let db = db().await;
  let devices = db.devices();
  let pad = devices
    .add_voting_device(NewVotingDevice::new("Pad 1", "1001"))
    .await
    .unwrap();
  let kit = devices
    .add_device_kit(NewDeviceKit { name: "Case A".into(), is_default: false })
    .await
    .unwrap();

  devices.assign_device_to_kit(kit.id, pad.id).await.unwrap();
  assert!(matches!(
    devices.assign_device_to_kit(kit.id, pad.id).await,
    Err(Error::DuplicateKey { entity: "kit assignment", .. })
  ));
  assert_eq!(devices.get_kits_for_voting_device(pad.id).await.unwrap().len(), 2);

  devices.remove_device_from_kit(kit.id, pad.id).await.unwrap();
  assert!(matches!(
    devices.remove_device_from_kit(kit.id, pad.id).await,
    Err(Error::NotFound { entity: "kit assignment", .. })
  ));
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn session_columns_round_trip() {
  let db = db().await;
  let mut input = NewSession::new("CACES R489 May", date(2024, 5, 29));
  input.selected_block_ids = BTreeSet::from([3, 1]);
  input.location = Some("Lyon".into());
  let session = db.sessions().add_session(input).await.unwrap();
  assert_eq!(session.status, SessionStatus::Planned);

  let anomalies = ImportAnomalies {
    expected_issues: vec![ExpectedIssue {
      serial_number: "1001".into(),
      resolution:    ExpectedIssueAction::AggregateWithUnknown {
        source_serial: "2002".into(),
      },
    }],
    unknown_devices: vec![UnknownDevice {
      serial_number: "3003".into(),
      resolution:    UnknownDeviceAction::AddAsNewParticipant { name: "Grace".into() },
    }],
    resolved_at:     Some(Utc.timestamp_millis_opt(1_717_000_123_456).unwrap()),
  };
  db.sessions()
    .update_session(session.id, SessionUpdate {
      ignored_slide_guids: Some(BTreeSet::from(["{slide-7}".to_string()])),
      resolved_import_anomalies: Some(Some(anomalies.clone())),
      ..Default::default()
    })
    .await
    .unwrap();

  let mappings = vec![QuestionMapping {
    question_id:   42,
    slide_guid:    Some("{slide-1}".into()),
    order_in_file: 1,
    theme_label:   "A".into(),
    block_code:    "1".into(),
  }];
  let mut iteration = NewSessionIteration::new(session.id, 0);
  iteration.question_mappings = mappings.clone();
  db.sessions().add_or_update_session_iteration(iteration).await.unwrap();

  let stored = db.sessions().get_session(session.id).await.unwrap().unwrap();
  assert_eq!(stored.selected_block_ids, BTreeSet::from([1, 3]));
  assert_eq!(stored.ignored_slide_guids.len(), 1);
  assert_eq!(stored.resolved_import_anomalies, Some(anomalies));
  assert_eq!(stored.date, date(2024, 5, 29));
  assert_eq!(stored.location.as_deref(), Some("Lyon"));

  let iterations = db.sessions().get_session_iterations(session.id).await.unwrap();
  assert_eq!(iterations[0].question_mappings, mappings);
  assert_eq!(iterations[0].name, "Iteration 1");
}

#[tokio::test]
async fn malformed_json_columns_read_as_defaults() {
  let db = db().await;
  let mut input = NewSession::new("Broken", date(2024, 1, 8));
  input.selected_block_ids = BTreeSet::from([1, 2]);
  let session = db.sessions().add_session(input).await.unwrap();

  let id = session.id;
  db.connection()
    .call(move |conn| {
      conn.execute(
        "UPDATE sessions
            SET selected_block_ids = '[1,', resolved_import_anomalies = '{oops'
          WHERE id = ?1",
        rusqlite::params![id],
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let stored = db.sessions().get_session(session.id).await.unwrap().unwrap();
  assert!(stored.selected_block_ids.is_empty());
  assert_eq!(stored.resolved_import_anomalies, None);
  assert_eq!(db.sessions().get_all_sessions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn status_changes_follow_the_lifecycle() {
  let db = db().await;
  let sessions = db.sessions();
  let s = sessions
    .add_session(NewSession::new("Lifecycle", date(2024, 2, 1)))
    .await
    .unwrap();

  let ready = SessionUpdate { status: Some(SessionStatus::Ready), ..Default::default() };
  assert_eq!(sessions.update_session(s.id, ready).await.unwrap().status, SessionStatus::Ready);

  let completed =
    SessionUpdate { status: Some(SessionStatus::Completed), ..Default::default() };
  assert!(matches!(
    sessions.update_session(s.id, completed).await,
    Err(Error::Core(certis_core::Error::InvalidStatusTransition { .. }))
  ));

  let running =
    SessionUpdate { status: Some(SessionStatus::InProgress), ..Default::default() };
  sessions.update_session(s.id, running).await.unwrap();

  let back = SessionUpdate { status: Some(SessionStatus::Planned), ..Default::default() };
  assert!(sessions.update_session(s.id, back).await.is_err());

  let stored = sessions.get_session(s.id).await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::InProgress);

  assert!(matches!(
    sessions.update_session(9_999, SessionUpdate::default()).await,
    Err(Error::NotFound { entity: "session", .. })
  ));
}

#[tokio::test]
async fn iteration_upsert_keeps_identity() {
  let db = db().await;
  let s = db
    .sessions()
    .add_session(NewSession::new("Two rounds", date(2024, 3, 4)))
    .await
    .unwrap();

  let mut first = NewSessionIteration::new(s.id, 1);
  first.name = Some("Afternoon".into());
  let created = db.sessions().add_or_update_session_iteration(first).await.unwrap();

  let mut again = NewSessionIteration::new(s.id, 1);
  again.name = Some("Renamed".into());
  again.generated_file_path = Some("/tmp/afternoon.ors".into());
  again.status = IterationStatus::Ready;
  let updated = db.sessions().add_or_update_session_iteration(again).await.unwrap();

  assert_eq!(updated.id, created.id);
  assert_eq!(updated.name, "Afternoon");
  assert_eq!(updated.status, IterationStatus::Ready);
  assert_eq!(updated.generated_file_path.as_deref(), Some("/tmp/afternoon.ors"));
  assert_eq!(db.sessions().get_session_iterations(s.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn session_detail_collects_iterations_and_participants() {
  let db = db().await;
  let a = attendance(&db).await;
  let second = db
    .sessions()
    .add_or_update_session_iteration(NewSessionIteration::new(a.session.id, 1))
    .await
    .unwrap();
  let kit = db.devices().get_global_device_kit().await.unwrap().unwrap();
  db.sessions()
    .add_participant_assignment(NewParticipantAssignment {
      session_iteration_id: second.id,
      participant_id:       a.participants[1].id,
      voting_device_id:     a.devices[0].id,
      kit_id:               kit.id,
      status:               AssignmentStatus::Present,
    })
    .await
    .unwrap();

  let detail = db.sessions().get_session_by_id(a.session.id).await.unwrap().unwrap();
  assert_eq!(detail.iterations.len(), 2);
  assert_eq!(detail.iterations[0].iteration.iteration_index, 0);
  assert_eq!(detail.iterations[0].assignments.len(), 2);
  assert_eq!(detail.iterations[1].assignments[0].device_serial, "1001");
  assert_eq!(
    detail.participants.iter().map(|p| p.last_name.as_str()).collect::<Vec<_>>(),
    ["Lovelace", "Turing"]
  );

  assert!(db.sessions().get_session_by_id(9_999).await.unwrap().is_none());
}

#[tokio::test]
async fn double_booking_is_rejected() {
  let db = db().await;
  let a = attendance(&db).await;
  let kit = db.devices().get_global_device_kit().await.unwrap().unwrap();

  let same_participant = NewParticipantAssignment {
    session_iteration_id: a.iteration.id,
    participant_id:       a.participants[0].id,
    voting_device_id:     a.devices[1].id,
    kit_id:               kit.id,
    status:               AssignmentStatus::Present,
  };
  assert!(matches!(
    db.sessions().add_participant_assignment(same_participant).await,
    Err(Error::DuplicateKey { entity: "participant assignment", .. })
  ));

  let newcomer = db
    .sessions()
    .add_participant(NewParticipant::new("Grace", "Hopper"))
    .await
    .unwrap();
  let same_device = NewParticipantAssignment {
    session_iteration_id: a.iteration.id,
    participant_id:       newcomer.id,
    voting_device_id:     a.devices[0].id,
    kit_id:               kit.id,
    status:               AssignmentStatus::Present,
  };
  assert!(matches!(
    db.sessions().add_participant_assignment(same_device).await,
    Err(Error::DuplicateKey { .. })
  ));
  assert_eq!(
    db.sessions().get_assignments_for_iteration(a.iteration.id).await.unwrap().len(),
    2
  );
}

#[tokio::test]
async fn participant_status_and_clearing() {
  let db = db().await;
  let a = attendance(&db).await;
  let sessions = db.sessions();

  sessions
    .update_participant_status_in_iteration(
      a.iteration.id,
      a.participants[1].id,
      AssignmentStatus::Absent,
    )
    .await
    .unwrap();
  let assignments = sessions.get_assignments_for_iteration(a.iteration.id).await.unwrap();
  let absent = assignments
    .iter()
    .find(|x| x.participant_id == a.participants[1].id)
    .unwrap();
  assert_eq!(absent.status, AssignmentStatus::Absent);

  assert!(matches!(
    sessions
      .update_participant_status_in_iteration(a.iteration.id, 9_999, AssignmentStatus::Absent)
      .await,
    Err(Error::NotFound { .. })
  ));

  assert_eq!(sessions.clear_assignments_for_iteration(a.iteration.id).await.unwrap(), 2);
  assert!(sessions.get_assignments_for_iteration(a.iteration.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn upsert_participant_dedupes_on_identification_code() {
  let db = db().await;
  let sessions = db.sessions();

  let mut input = NewParticipant::new("Ada", "Lovelace");
  input.identification_code = Some(" AB-12 ".into());
  let first = sessions.upsert_participant(input.clone()).await.unwrap();
  input.organization = Some("Analytical Engines".into());
  let second = sessions.upsert_participant(input).await.unwrap();
  assert_eq!(first.id, second.id);
  assert_eq!(second.identification_code.as_deref(), Some("AB-12"));

  let stored = sessions.get_participant_by_id(first.id).await.unwrap().unwrap();
  assert_eq!(stored.organization.as_deref(), Some("Analytical Engines"));

  let mut blank = NewParticipant::new("Ada", "Lovelace");
  blank.identification_code = Some("   ".into());
  let other = sessions.upsert_participant(blank).await.unwrap();
  assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn session_listing_derives_aggregates() {
  let db = db().await;
  let a = attendance(&db).await;
  let q1 = question(&db, None, "q1").await;
  let q2 = question(&db, None, "q2").await;
  let (s, i) = (&a.session, &a.iteration);

  db.results()
    .add_bulk_session_results(vec![
      answer(s, i, &q1, "1001", true),
      answer(s, i, &q2, "1001", true),
      answer(s, i, &q1, "1002", true),
      answer(s, i, &q2, "1002", false),
    ])
    .await
    .unwrap();

  let empty = db
    .sessions()
    .add_session(NewSession::new("Later", date(2024, 6, 12)))
    .await
    .unwrap();

  let listing = db.sessions().get_all_sessions().await.unwrap();
  assert_eq!(listing.len(), 2);
  // Newest date first.
  assert_eq!(listing[0].session.id, empty.id);
  assert_eq!(listing[0].participant_count, 0);
  assert_eq!(listing[0].average_score, None);
  assert_eq!(listing[1].participant_count, 2);
  assert_eq!(listing[1].average_score, Some(75.0));
}

#[tokio::test]
async fn scoring_runs_over_stored_session() {
  let db = db().await;
  let a = attendance(&db).await;
  let q1 = question(&db, None, "q1").await;
  let q2 = question(&db, None, "q2").await;
  let (s, i) = (&a.session, &a.iteration);

  db.results()
    .add_bulk_session_results(vec![
      answer(s, i, &q1, "1001", true),
      answer(s, i, &q2, "1001", true),
      answer(s, i, &q1, "1002", false),
    ])
    .await
    .unwrap();

  let detail = db.sessions().get_session_by_id(s.id).await.unwrap().unwrap();
  let results = db.results().get_results_for_session(s.id).await.unwrap();
  let exam = db.catalog().exam_questions(&[q1.id, q2.id]).await.unwrap();
  let devices = db.devices().device_serial_map().await.unwrap();

  let stats = session_stats(&detail, &results, &exam, &devices, &Thresholds::default());
  assert_eq!(stats.participant_count, 2);
  assert_eq!(stats.average_score, 50.0);
  assert_eq!(stats.success_rate, 50.0);
}

#[tokio::test]
async fn finalization_waits_for_every_iteration() {
  let db = db().await;
  let sessions = db.sessions();
  let s = sessions
    .add_session(NewSession::new("Finalize", date(2024, 4, 2)))
    .await
    .unwrap();

  assert_eq!(
    sessions.check_and_finalize_session_status(s.id).await.unwrap(),
    Finalization::Pending(SessionStatus::Planned)
  );

  let mut morning = NewSessionIteration::new(s.id, 0);
  morning.status = IterationStatus::Completed;
  sessions.add_or_update_session_iteration(morning).await.unwrap();
  let afternoon = sessions
    .add_or_update_session_iteration(NewSessionIteration::new(s.id, 1))
    .await
    .unwrap();

  assert_eq!(
    sessions.check_and_finalize_session_status(s.id).await.unwrap(),
    Finalization::Pending(SessionStatus::Planned)
  );
  let stored = sessions.get_session(s.id).await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Planned);
  assert!(stored.results_imported_at.is_none());

  sessions
    .set_iteration_status(afternoon.id, IterationStatus::Cancelled)
    .await
    .unwrap();
  assert_eq!(
    sessions.check_and_finalize_session_status(s.id).await.unwrap(),
    Finalization::Completed
  );
  let stored = sessions.get_session(s.id).await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Completed);
  assert!(stored.results_imported_at.is_some());

  assert_eq!(
    sessions.check_and_finalize_session_status(s.id).await.unwrap(),
    Finalization::Unchanged(SessionStatus::Completed)
  );
  assert!(matches!(
    sessions.check_and_finalize_session_status(9_999).await,
    Err(Error::NotFound { entity: "session", .. })
  ));
}

#[tokio::test]
async fn archiving_only_touches_old_completed_sessions() {
  let db = db().await;
  let sessions = db.sessions();

  let mut ids = Vec::new();
  for name in ["old", "recent"] {
    let s = sessions
      .add_session(NewSession::new(name, date(2024, 1, 15)))
      .await
      .unwrap();
    let mut it = NewSessionIteration::new(s.id, 0);
    it.status = IterationStatus::Completed;
    sessions.add_or_update_session_iteration(it).await.unwrap();
    sessions.check_and_finalize_session_status(s.id).await.unwrap();
    ids.push(s.id);
  }
  sessions
    .update_session(ids[0], SessionUpdate {
      results_imported_at: Some(Some(Utc::now() - Duration::days(10))),
      ..Default::default()
    })
    .await
    .unwrap();
  let planned = sessions
    .add_session(NewSession::new("planned", date(2024, 1, 15)))
    .await
    .unwrap();

  assert_eq!(sessions.archive_old_sessions().await.unwrap(), 1);
  assert_eq!(sessions.archive_old_sessions().await.unwrap(), 0);

  let old = sessions.get_session(ids[0]).await.unwrap().unwrap();
  assert!(old.archived_at.is_some());
  assert_eq!(old.status, SessionStatus::Completed);
  let recent = sessions.get_session(ids[1]).await.unwrap().unwrap();
  assert!(recent.archived_at.is_none());
  let planned = sessions.get_session(planned.id).await.unwrap().unwrap();
  assert!(planned.archived_at.is_none());
}

#[tokio::test]
async fn deleting_a_session_cascades() {
  let db = db().await;
  let a = attendance(&db).await;
  let q = question(&db, None, "q").await;
  db.results()
    .add_session_result(answer(&a.session, &a.iteration, &q, "1001", true))
    .await
    .unwrap();

  db.sessions().delete_session(a.session.id).await.unwrap();

  assert!(db.results().get_all_results().await.unwrap().is_empty());
  assert!(
    db.sessions()
      .get_assignments_for_iteration(a.iteration.id)
      .await
      .unwrap()
      .is_empty()
  );
  assert!(db.sessions().get_participant_by_id(a.participants[0].id).await.unwrap().is_some());
  assert!(matches!(
    db.sessions().delete_session(a.session.id).await,
    Err(Error::NotFound { .. })
  ));
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_results_roll_back_on_a_bad_row() {
  let db = db().await;
  let a = attendance(&db).await;
  let q = question(&db, None, "q").await;
  let (s, i) = (&a.session, &a.iteration);

  let mut bad = answer(s, i, &q, "1002", true);
  bad.question_id = 9_999;
  let err = db
    .results()
    .add_bulk_session_results(vec![
      answer(s, i, &q, "1001", true),
      bad,
      answer(s, i, &q, "1002", false),
    ])
    .await
    .unwrap_err();

  assert!(matches!(err, Error::ForeignKey { entity: "session result", .. }));
  assert!(db.results().get_results_for_session(s.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn results_are_scoped_to_their_iteration() {
  let db = db().await;
  let a = attendance(&db).await;
  let q = question(&db, None, "q").await;
  let second = db
    .sessions()
    .add_or_update_session_iteration(NewSessionIteration::new(a.session.id, 1))
    .await
    .unwrap();
  let s = &a.session;

  let ids = db
    .results()
    .add_bulk_session_results(vec![
      answer(s, &a.iteration, &q, "1001", true),
      answer(s, &second, &q, "1001", false),
      answer(s, &second, &q, "1002", true),
    ])
    .await
    .unwrap();
  assert_eq!(ids.len(), 3);

  assert_eq!(db.results().get_results_for_iteration(second.id).await.unwrap().len(), 2);
  assert_eq!(db.results().delete_results_for_iteration(second.id).await.unwrap(), 2);

  let left = db.results().get_results_for_session(s.id).await.unwrap();
  assert_eq!(left.len(), 1);
  assert_eq!(left[0].session_iteration_id, Some(a.iteration.id));
  assert_eq!(left[0].answer, Some(Answer::Choice("A".into())));
}

#[tokio::test]
async fn latest_answer_per_device_and_corrections() {
  let db = db().await;
  let a = attendance(&db).await;
  let q = question(&db, None, "q").await;
  let (s, i) = (&a.session, &a.iteration);

  let first = answer(s, i, &q, "1001", false);
  let mut retry = answer(s, i, &q, "1001", true);
  retry.timestamp = first.timestamp + Duration::seconds(5);
  db.results().add_bulk_session_results(vec![first, retry]).await.unwrap();

  let latest = db
    .results()
    .get_result_by_session_and_question(s.id, q.id, "1001")
    .await
    .unwrap()
    .unwrap();
  assert!(latest.is_correct);
  assert!(
    db.results()
      .get_result_by_session_and_question(s.id, q.id, "1002")
      .await
      .unwrap()
      .is_none()
  );

  let corrected = db
    .results()
    .update_session_result(latest.id, SessionResultUpdate {
      participant_id: Some(Some(a.participants[0].id)),
      is_correct: Some(false),
      points_obtained: Some(0),
      ..Default::default()
    })
    .await
    .unwrap();
  assert!(!corrected.is_correct);
  let stored = db.results().get_result_by_id(latest.id).await.unwrap().unwrap();
  assert_eq!(stored.participant_id, Some(a.participants[0].id));
  assert!(!stored.is_correct);
}

// ─── Trainers and settings ───────────────────────────────────────────────────

#[tokio::test]
async fn one_default_trainer() {
  let db = db().await;
  let trainers = db.trainers();
  let marie = trainers
    .add_trainer(NewTrainer { name: "Marie".into(), is_default: true })
    .await
    .unwrap();
  let paul = trainers
    .add_trainer(NewTrainer { name: "Paul".into(), is_default: true })
    .await
    .unwrap();
  assert_eq!(trainers.get_default_trainer().await.unwrap().unwrap().id, paul.id);

  trainers.set_default_trainer(marie.id).await.unwrap();
  let all = trainers.get_all_trainers().await.unwrap();
  assert_eq!(all.iter().filter(|t| t.is_default).count(), 1);
  assert_eq!(trainers.get_default_trainer().await.unwrap().unwrap().id, marie.id);

  assert!(matches!(
    trainers.set_default_trainer(9_999).await,
    Err(Error::NotFound { entity: "trainer", .. })
  ));
  assert_eq!(trainers.get_default_trainer().await.unwrap().unwrap().id, marie.id);

  let renamed = trainers.rename_trainer(paul.id, "Paul B.".into()).await.unwrap();
  assert_eq!(renamed.name, "Paul B.");
  assert!(!renamed.is_default);
  assert!(matches!(
    trainers.rename_trainer(9_999, "Nobody".into()).await,
    Err(Error::NotFound { entity: "trainer", .. })
  ));
  trainers.delete_trainer(paul.id).await.unwrap();
  assert!(trainers.get_trainer_by_id(paul.id).await.unwrap().is_none());
}

#[tokio::test]
async fn settings_hold_json_values() {
  let db = db().await;
  let settings = db.settings();
  assert!(settings.get_setting("thresholds").await.unwrap().is_none());

  let value = serde_json::json!({ "global": 80.0, "per_theme": 60.0 });
  settings.set_setting("thresholds", &value).await.unwrap();
  settings.set_setting("thresholds", &value).await.unwrap();
  settings.set_setting("company", &serde_json::json!("ACME")).await.unwrap();

  assert_eq!(settings.get_setting("thresholds").await.unwrap(), Some(value));
  assert_eq!(settings.get_all_settings().await.unwrap().len(), 2);
  assert!(settings.delete_setting("company").await.unwrap());
  assert!(!settings.delete_setting("company").await.unwrap());
}

// ─── Schema ──────────────────────────────────────────────────────────────────

async fn schema_snapshot(db: &Database) -> (Vec<(String, String, Option<String>)>, Vec<u32>) {
  db.connection()
    .call(|conn| {
      let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
          WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
      )?;
      let objects = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
      let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      Ok((objects, versions))
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn migrating_twice_changes_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("certis.db");

  let db = Database::connect(&path).await.unwrap();
  let report = db.ensure_schema().await.unwrap();
  assert_eq!(report.applied, [1, 2, 3, 4, 5, 6, 7, 8]);
  assert!(report.failed.is_empty());
  let before = schema_snapshot(&db).await;
  db.close().await.unwrap();

  let db = Database::connect(&path).await.unwrap();
  let report = db.ensure_schema().await.unwrap();
  assert!(report.already_current);
  assert!(report.applied.is_empty());
  assert_eq!(schema_snapshot(&db).await, before);
  assert_eq!(before.1, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn legacy_database_is_adopted() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("legacy.db");

  {
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn
      .execute_batch(
        "CREATE TABLE sessions (
           id                        INTEGER PRIMARY KEY AUTOINCREMENT,
           name                      TEXT NOT NULL,
           date                      TEXT NOT NULL,
           referential_id            INTEGER,
           selected_block_ids        TEXT NOT NULL DEFAULT '[]',
           selected_kit_id           INTEGER,
           trainer_id                INTEGER,
           status                    TEXT NOT NULL DEFAULT 'planned',
           ignored_slide_guids       TEXT NOT NULL DEFAULT '[]',
           resolved_import_anomalies TEXT,
           location                  TEXT,
           notes                     TEXT,
           created_at                TEXT NOT NULL
         );
         CREATE TABLE session_iterations (
           id                INTEGER PRIMARY KEY AUTOINCREMENT,
           session_id        INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
           iteration_index   INTEGER NOT NULL,
           name              TEXT NOT NULL,
           ors_file_path     TEXT,
           status            TEXT NOT NULL DEFAULT 'planned',
           question_mappings TEXT NOT NULL DEFAULT '[]',
           created_at        TEXT NOT NULL,
           UNIQUE (session_id, iteration_index)
         );
         INSERT INTO sessions (name, date, status, created_at)
           VALUES ('From the old days', '2023-11-20', 'completed', '2023-11-20T08:00:00.000Z');
         INSERT INTO session_iterations
           (session_id, iteration_index, name, ors_file_path, status, created_at)
           VALUES (1, 0, 'Morning', 'C:/decks/morning.ors', 'completed',
                   '2023-11-20T08:00:00.000Z');",
      )
      .unwrap();
  }

  let db = Database::connect(&path).await.unwrap();
  let report = db.ensure_schema().await.unwrap();
  assert!(report.failed.is_empty());
  assert_eq!(report.applied.first(), Some(&1));

  let session = db.sessions().get_session(1).await.unwrap().unwrap();
  assert_eq!(session.name, "From the old days");
  assert_eq!(session.iteration_count, 1);
  assert_eq!(session.status, SessionStatus::Completed);
  assert!(session.updated_at.is_none());

  let iterations = db.sessions().get_session_iterations(1).await.unwrap();
  assert_eq!(
    iterations[0].generated_file_path.as_deref(),
    Some("C:/decks/morning.ors")
  );
}

fn broken_step(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
  tx.execute_batch("ALTER TABLE nowhere ADD COLUMN x TEXT;")
}

fn working_step(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
  tx.execute_batch("CREATE TABLE IF NOT EXISTS scratch (id INTEGER PRIMARY KEY);")
}

const TRIAL_STEPS: &[Migration] = &[
  Migration { version: 90, name: "broken", apply: broken_step },
  Migration { version: 91, name: "working", apply: working_step },
];

#[tokio::test]
async fn failed_step_is_skipped_and_reported() {
  let db = db().await;

  let (applied, failed) = db
    .connection()
    .call(|conn| Ok(schema::apply_steps(conn, TRIAL_STEPS)?))
    .await
    .unwrap();
  assert_eq!(applied, [91]);
  assert_eq!(failed.len(), 1);
  assert_eq!((failed[0].version, failed[0].name), (90, "broken"));

  let versions = db
    .connection()
    .call(|conn| Ok(schema::recorded_versions(conn)?))
    .await
    .unwrap();
  assert!(versions.contains(&91));
  assert!(!versions.contains(&90));
}

#[tokio::test]
async fn operations_need_their_migration() {
  let db = db().await;
  let mut applied = db.schema().applied();
  applied.remove(&4);
  db.schema().replace(applied);

  assert!(matches!(
    db.results().get_all_results().await,
    Err(Error::SchemaNotCurrent { version: 4, name: "result attribution" })
  ));
  // Unaffected areas keep working.
  assert!(db.catalog().get_all_referentials().await.unwrap().is_empty());

  db.ensure_schema().await.unwrap();
  assert!(db.results().get_all_results().await.unwrap().is_empty());
}

#[tokio::test]
async fn unmigrated_connection_refuses_work() {
  let dir = tempfile::tempdir().unwrap();
  let db = Database::connect(dir.path().join("fresh.db")).await.unwrap();
  assert!(matches!(
    db.sessions().get_all_sessions().await,
    Err(Error::SchemaNotCurrent { version: 2, .. })
  ));
}
