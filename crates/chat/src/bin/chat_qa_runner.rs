use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use snafu::{OptionExt, ResultExt, Snafu};

use duet_chat::settings::SettingsError;
use duet_chat::{
    ChatCore, ChatError, ChatSettings, ErrorKind, MessageId, SessionContext, SettingsStore,
    StaticAuthenticator, StaticProfiles, Update, UserId, parse_user, resolve,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<String>,
    save_config: bool,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    ResolveSymmetry,
    EnsureIdempotent,
    AppendOrder,
    RejectInvalid,
    SubscribeSnapshots,
    UnsubscribeStops,
    EndToEnd,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "resolve_symmetry" => Some(Self::ResolveSymmetry),
            "ensure_idempotent" => Some(Self::EnsureIdempotent),
            "append_order" => Some(Self::AppendOrder),
            "reject_invalid" => Some(Self::RejectInvalid),
            "subscribe_snapshots" => Some(Self::SubscribeSnapshots),
            "unsubscribe_stops" => Some(Self::UnsubscribeStops),
            "end_to_end" => Some(Self::EndToEnd),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ResolveSymmetry => "resolve_symmetry",
            Self::EnsureIdempotent => "ensure_idempotent",
            Self::AppendOrder => "append_order",
            Self::RejectInvalid => "reject_invalid",
            Self::SubscribeSnapshots => "subscribe_snapshots",
            Self::UnsubscribeStops => "unsubscribe_stops",
            Self::EndToEnd => "end_to_end",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("chat operation failed on `{stage}`: {source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    SaveSettings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => println!("runner_ok=true"),
        Err(error) => {
            println!("runner_ok=false");
            eprintln!("runner_error={error}");
            std::process::exit(1);
        }
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let (store, settings) = load_settings(&args);
    println!("config_path={}", store.config_path().display());
    println!(
        "placeholder_display_name={}",
        settings.placeholder_display_name
    );
    if args.save_config {
        store.update(settings.clone()).context(SaveSettingsSnafu {
            stage: "save-settings",
        })?;
        println!("config_saved=true");
    }

    let core = open_core(&args, &settings).await?;
    match args.scenario {
        Scenario::ResolveSymmetry => run_resolve_symmetry(),
        Scenario::EnsureIdempotent => run_ensure_idempotent(&core).await,
        Scenario::AppendOrder => run_append_order(&core).await,
        Scenario::RejectInvalid => run_reject_invalid(&core).await,
        Scenario::SubscribeSnapshots => run_subscribe_snapshots(&core).await,
        Scenario::UnsubscribeStops => run_unsubscribe_stops(&core).await,
        Scenario::EndToEnd => run_end_to_end(&core, &settings).await,
        Scenario::All => run_all(&core, &settings).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
    let mut save_config = false;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(value);
            }
            "--save-config" => save_config = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        config_path,
        save_config,
    })
}

// Settings come from --config or the default location; --db overrides the database path.
fn load_settings(args: &RunnerArgs) -> (SettingsStore, ChatSettings) {
    let store = match args.config_path.as_deref() {
        Some(path) => SettingsStore::new(PathBuf::from(path)),
        None => SettingsStore::load(),
    };
    let mut settings = ChatSettings::clone(&store.settings());
    if let Some(db_path) = args.db_path.as_deref() {
        settings.database_path = PathBuf::from(db_path);
    }
    (store, settings)
}

// Without --db or --config nothing asked for a database file, so scenarios run in memory.
fn uses_sqlite(args: &RunnerArgs) -> bool {
    args.db_path.is_some() || args.config_path.is_some()
}

async fn open_core(args: &RunnerArgs, settings: &ChatSettings) -> RunnerResult<ChatCore> {
    if !uses_sqlite(args) {
        println!("storage=memory");
        return Ok(ChatCore::in_memory());
    }

    println!("storage=sqlite");
    println!("db_path={}", settings.database_path.display());
    ChatCore::open(settings).await.context(ChatSnafu {
        stage: "open-core",
    })
}

async fn run_all(core: &ChatCore, settings: &ChatSettings) -> RunnerResult<()> {
    run_resolve_symmetry()?;
    run_ensure_idempotent(core).await?;
    run_append_order(core).await?;
    run_reject_invalid(core).await?;
    run_subscribe_snapshots(core).await?;
    run_unsubscribe_stops(core).await?;
    run_end_to_end(core, settings).await?;

    println!("all_passed=true");
    Ok(())
}

fn run_resolve_symmetry() -> RunnerResult<()> {
    let alice = user("alice")?;
    let bob = user("bob")?;

    let forward = resolve(&alice, &bob).context(ChatSnafu {
        stage: "scenario-resolve-symmetry-forward",
    })?;
    let backward = resolve(&bob, &alice).context(ChatSnafu {
        stage: "scenario-resolve-symmetry-backward",
    })?;
    let resolve_symmetric = forward == backward;

    println!("conversation_id={forward}");
    println!("resolve_symmetric={resolve_symmetric}");
    if !resolve_symmetric || forward.as_str() != "alice_bob" {
        return ScenarioFailedSnafu {
            stage: "scenario-resolve-symmetry-assert",
            scenario: "resolve_symmetry",
            reason: format!("expected alice_bob both ways, got {forward} and {backward}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_ensure_idempotent(core: &ChatCore) -> RunnerResult<()> {
    let first = unique_user("carol")?;
    let second = unique_user("dave")?;

    let created = core
        .conversations
        .ensure_conversation(&first, &second)
        .await
        .context(ChatSnafu {
            stage: "scenario-ensure-idempotent-first",
        })?;
    let again = core
        .conversations
        .ensure_conversation(&second, &first)
        .await
        .context(ChatSnafu {
            stage: "scenario-ensure-idempotent-second",
        })?;
    let listed = core
        .conversations
        .conversations_for(&first)
        .await
        .context(ChatSnafu {
            stage: "scenario-ensure-idempotent-list",
        })?;

    let ensure_idempotent = created == again && listed.len() == 1;
    println!("conversation_count={}", listed.len());
    println!("ensure_idempotent={ensure_idempotent}");
    if !ensure_idempotent {
        return ScenarioFailedSnafu {
            stage: "scenario-ensure-idempotent-assert",
            scenario: "ensure_idempotent",
            reason: format!(
                "expected one shared conversation, got {created} / {again} with {} records",
                listed.len()
            ),
        }
        .fail();
    }

    Ok(())
}

async fn run_append_order(core: &ChatCore) -> RunnerResult<()> {
    let first = unique_user("erin")?;
    let second = unique_user("frank")?;
    let conversation_id = core
        .conversations
        .ensure_conversation(&first, &second)
        .await
        .context(ChatSnafu {
            stage: "scenario-append-order-ensure",
        })?;

    let texts = ["one", "two", "three", "four"];
    for (index, text) in texts.iter().enumerate() {
        let sender = if index % 2 == 0 { &first } else { &second };
        core.log
            .append(&conversation_id, sender, sender.as_str(), text)
            .await
            .context(ChatSnafu {
                stage: "scenario-append-order-append",
            })?;
    }

    let messages = core
        .log
        .read_ordered(&conversation_id)
        .await
        .context(ChatSnafu {
            stage: "scenario-append-order-read",
        })?;
    let stored = messages
        .iter()
        .map(|message| message.text.as_str())
        .collect::<Vec<_>>();
    let seq_increasing = messages.windows(2).all(|pair| pair[0].seq < pair[1].seq);
    let append_order = stored == texts && seq_increasing;

    println!("message_count={}", messages.len());
    println!("append_order={append_order}");
    if !append_order {
        return ScenarioFailedSnafu {
            stage: "scenario-append-order-assert",
            scenario: "append_order",
            reason: format!("expected {texts:?} in order, got {stored:?}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_reject_invalid(core: &ChatCore) -> RunnerResult<()> {
    let first = unique_user("gina")?;
    let second = unique_user("hank")?;
    let outsider = unique_user("ivan")?;
    let conversation_id = core
        .conversations
        .ensure_conversation(&first, &second)
        .await
        .context(ChatSnafu {
            stage: "scenario-reject-invalid-ensure",
        })?;

    let blank_rejected = error_kind(
        core.log
            .append(&conversation_id, &first, "Gina", "   ")
            .await,
    ) == Some(ErrorKind::InvalidMessage);
    let outsider_rejected = error_kind(
        core.log
            .append(&conversation_id, &outsider, "Ivan", "let me in")
            .await,
    ) == Some(ErrorKind::Unauthorized);
    let empty_identity_rejected =
        error_kind(parse_user("  ")) == Some(ErrorKind::InvalidIdentity);
    let same_user_rejected = error_kind(
        core.conversations
            .ensure_conversation(&first, &first)
            .await,
    ) == Some(ErrorKind::InvalidIdentity);

    let remaining = core
        .log
        .read_ordered(&conversation_id)
        .await
        .context(ChatSnafu {
            stage: "scenario-reject-invalid-read",
        })?;

    let reject_invalid = blank_rejected
        && outsider_rejected
        && empty_identity_rejected
        && same_user_rejected
        && remaining.is_empty();
    println!("blank_rejected={blank_rejected}");
    println!("outsider_rejected={outsider_rejected}");
    println!("empty_identity_rejected={empty_identity_rejected}");
    println!("same_user_rejected={same_user_rejected}");
    println!("reject_invalid={reject_invalid}");
    if !reject_invalid {
        return ScenarioFailedSnafu {
            stage: "scenario-reject-invalid-assert",
            scenario: "reject_invalid",
            reason: format!(
                "invalid input was accepted or left {} stored messages",
                remaining.len()
            ),
        }
        .fail();
    }

    Ok(())
}

async fn run_subscribe_snapshots(core: &ChatCore) -> RunnerResult<()> {
    let first = unique_user("jane")?;
    let second = unique_user("kyle")?;
    let conversation_id = core
        .conversations
        .ensure_conversation(&first, &second)
        .await
        .context(ChatSnafu {
            stage: "scenario-subscribe-snapshots-ensure",
        })?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = core
        .log
        .subscribe(&conversation_id, snapshot_recorder(&seen))
        .await
        .context(ChatSnafu {
            stage: "scenario-subscribe-snapshots-subscribe",
        })?;

    for text in ["m1", "m2"] {
        core.log
            .append(&conversation_id, &first, "Jane", text)
            .await
            .context(ChatSnafu {
                stage: "scenario-subscribe-snapshots-append",
            })?;
    }
    subscription.unsubscribe();

    let lengths = recorded(&seen);
    let subscribe_snapshots = lengths == vec![0, 1, 2];
    println!("snapshot_lengths={lengths:?}");
    println!("subscribe_snapshots={subscribe_snapshots}");
    if !subscribe_snapshots {
        return ScenarioFailedSnafu {
            stage: "scenario-subscribe-snapshots-assert",
            scenario: "subscribe_snapshots",
            reason: format!("expected snapshot lengths [0, 1, 2], got {lengths:?}"),
        }
        .fail();
    }

    Ok(())
}

async fn run_unsubscribe_stops(core: &ChatCore) -> RunnerResult<()> {
    let first = unique_user("lena")?;
    let second = unique_user("milo")?;
    let conversation_id = core
        .conversations
        .ensure_conversation(&first, &second)
        .await
        .context(ChatSnafu {
            stage: "scenario-unsubscribe-stops-ensure",
        })?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = core
        .log
        .subscribe(&conversation_id, snapshot_recorder(&seen))
        .await
        .context(ChatSnafu {
            stage: "scenario-unsubscribe-stops-subscribe",
        })?;
    subscription.unsubscribe();
    subscription.unsubscribe();

    core.log
        .append(&conversation_id, &second, "Milo", "anyone?")
        .await
        .context(ChatSnafu {
            stage: "scenario-unsubscribe-stops-append",
        })?;

    let lengths = recorded(&seen);
    let observers = core.log.observer_count(&conversation_id);
    let unsubscribe_stops = lengths == vec![0] && observers == 0;
    println!("observer_count={observers}");
    println!("unsubscribe_stops={unsubscribe_stops}");
    if !unsubscribe_stops {
        return ScenarioFailedSnafu {
            stage: "scenario-unsubscribe-stops-assert",
            scenario: "unsubscribe_stops",
            reason: format!(
                "expected only the initial snapshot and no observers, got {lengths:?} with {observers} observers"
            ),
        }
        .fail();
    }

    Ok(())
}

async fn run_end_to_end(core: &ChatCore, settings: &ChatSettings) -> RunnerResult<()> {
    let alice = unique_user("alice")?;
    let bob = unique_user("bob")?;
    let guest = unique_user("guest")?;
    let profiles = Arc::new(
        StaticProfiles::new()
            .with_user(alice.clone(), "Alice")
            .with_user(bob.clone(), "Bob"),
    );

    let mut alice_session = core.session(SessionContext::new(
        alice.clone(),
        Arc::new(StaticAuthenticator::signed_in(alice.clone())),
        profiles.clone(),
    ));
    let mut bob_session = core.session(SessionContext::new(
        bob.clone(),
        Arc::new(StaticAuthenticator::signed_in(bob.clone())),
        profiles.clone(),
    ));
    let mut guest_session = core.session(
        SessionContext::new(
            guest.clone(),
            Arc::new(StaticAuthenticator::signed_in(guest.clone())),
            profiles,
        )
        .with_placeholder_display_name(settings.placeholder_display_name.clone()),
    );

    let from_alice = alice_session
        .select_peer(&bob)
        .await
        .context(ChatSnafu {
            stage: "scenario-end-to-end-alice-select",
        })?;
    let from_bob = bob_session.select_peer(&alice).await.context(ChatSnafu {
        stage: "scenario-end-to-end-bob-select",
    })?;

    alice_session.send("hi").await.context(ChatSnafu {
        stage: "scenario-end-to-end-send",
    })?;

    let delivered = bob_session
        .latest_snapshot()
        .and_then(|snapshot| snapshot.messages.last().cloned());
    let delivered_ok = delivered
        .as_ref()
        .is_some_and(|message| message.sender_id == alice && message.text == "hi");
    let shared_conversation = from_alice == from_bob;

    guest_session.select_peer(&alice).await.context(ChatSnafu {
        stage: "scenario-end-to-end-guest-select",
    })?;
    guest_session.send("hello").await.context(ChatSnafu {
        stage: "scenario-end-to-end-guest-send",
    })?;
    let placeholder_ok = guest_session
        .latest_snapshot()
        .and_then(|snapshot| snapshot.messages.last().cloned())
        .is_some_and(|message| {
            message.sender_id == guest
                && message.sender_display_name == settings.placeholder_display_name
        });

    alice_session.close();
    bob_session.close();
    guest_session.close();
    let released = core.log.observer_count(&from_alice) == 0;

    println!("shared_conversation={shared_conversation}");
    println!("delivered_to_peer={delivered_ok}");
    println!("placeholder_name_used={placeholder_ok}");
    println!("subscriptions_released={released}");
    if !(shared_conversation && delivered_ok && placeholder_ok && released) {
        return ScenarioFailedSnafu {
            stage: "scenario-end-to-end-assert",
            scenario: "end_to_end",
            reason: format!(
                "shared_conversation={shared_conversation} delivered_to_peer={delivered_ok} placeholder_name_used={placeholder_ok} subscriptions_released={released}"
            ),
        }
        .fail();
    }

    Ok(())
}

fn user(raw: &str) -> RunnerResult<UserId> {
    parse_user(raw).context(ChatSnafu { stage: "parse-user" })
}

// A database passed with --db may already hold earlier runs, so each scenario uses fresh users.
fn unique_user(name: &str) -> RunnerResult<UserId> {
    user(&format!("{name}-{}", MessageId::new_v7()))
}

fn snapshot_recorder(seen: &Arc<Mutex<Vec<usize>>>) -> impl FnMut(Update) + Send + 'static {
    let seen = Arc::clone(seen);
    move |update: Update| {
        if let Update::Snapshot(snapshot) = update {
            seen.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(snapshot.len());
        }
    }
}

fn recorded(seen: &Mutex<Vec<usize>>) -> Vec<usize> {
    seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn error_kind<T>(result: Result<T, ChatError>) -> Option<ErrorKind> {
    result.err().map(|error| error.kind())
}
