//! Integration tests for session sharing, jump chains and authentication
//!
//! Sessions run against the scripted transport in `common`, so no SSH
//! server is needed.

mod common;

use common::{challenge, eventually, AuthScript, ConnectRecord, ForwardRecord, Harness, HostScript};
use ssh_session_manager::models::{
    AuthMethod, ConnectionIdentity, SecretKind, SessionEvent, SessionState, SshProfile,
};
use ssh_session_manager::services::config_service::ProfileStore;
use ssh_session_manager::services::secret_store::SecretStore;
use ssh_session_manager::utils::error::SshSessionError;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};
use uuid::Uuid;

/// Profile with a stored password, so start() never prompts
fn web() -> SshProfile {
    web_without_password().with_password("pw")
}

fn web_without_password() -> SshProfile {
    SshProfile::new("web", "web.internal", "deploy")
}

/// `bastion` and a `db` profile that jumps through it
fn jump_pair() -> (SshProfile, SshProfile) {
    let bastion = SshProfile::new("bastion", "bastion.example.com", "ops").with_password("pw");
    let db = SshProfile::new("db", "10.0.0.5", "deploy")
        .with_password("pw")
        .with_jump_host(bastion.id);
    (bastion, db)
}

// =============================================================================
// Sharing and reference counting
// =============================================================================

#[tokio::test]
async fn test_reuse_shares_one_connection() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let first = h.open(&profile).await;
    let second = h.multiplexer.get_or_create(&profile, true);

    assert_eq!(first.id(), second.id());
    assert_eq!(second.ref_count(), 2);
    second.start().await.unwrap();
    assert_eq!(h.transport.connect_count("web.internal"), 1);
    assert_eq!(h.notifier.count(&SessionEvent::Reused { ref_count: 2 }), 1);
    assert_eq!(h.multiplexer.len(), 1);
}

#[tokio::test]
async fn test_reuse_matches_on_endpoint_and_user() {
    let a = web();
    let b = SshProfile::new("web (copy)", "WEB.internal", "deploy").with_port(22);
    let other_user = SshProfile::new("web as root", "web.internal", "root").with_password("pw");
    let h = Harness::new(vec![a.clone(), b.clone(), other_user.clone()]);

    let sa = h.open(&a).await;
    let sb = h.open(&b).await;
    let sc = h.open(&other_user).await;

    assert_eq!(sa.id(), sb.id());
    assert_ne!(sa.id(), sc.id());
    assert_eq!(h.transport.connect_count("web.internal"), 2);
}

#[tokio::test]
async fn test_reuse_disabled_creates_dedicated_sessions() {
    let shared = web();
    let pinned = web().with_reuse_session(false);
    let h = Harness::new(vec![shared.clone()]);

    let a = h.open(&shared).await;
    let b = h.multiplexer.get_or_create(&shared, false);
    let c = h.multiplexer.get_or_create(&pinned, true);

    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
    assert_ne!(b.id(), c.id());
    assert!(!b.identity().is_shared());
    assert!(!c.identity().is_shared());
    assert_eq!(a.ref_count(), 1);
}

#[tokio::test]
async fn test_last_unref_destroys_and_unregisters() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    let identity = ConnectionIdentity::for_profile(&profile, true);

    let a = h.open(&profile).await;
    let b = h.multiplexer.get_or_create(&profile, true);

    assert_eq!(a.unref(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.is_open());

    assert_eq!(b.unref(), 0);
    a.destroyed().await;
    assert_eq!(a.state(), SessionState::Destroyed);
    assert!(h.multiplexer.find(&identity).is_none());
    assert!(h.multiplexer.is_empty());

    let fresh = h.multiplexer.get_or_create(&profile, true);
    assert_ne!(fresh.id(), a.id());
}

#[tokio::test]
async fn test_ref_taken_before_scheduled_destroy_keeps_session() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let a = h.open(&profile).await;
    assert_eq!(a.unref(), 0);
    // Same tick: the scheduled teardown has not run yet
    let b = h.multiplexer.get_or_create(&profile, true);
    assert_eq!(a.id(), b.id());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(b.is_open());
    assert_eq!(b.ref_count(), 1);
}

#[tokio::test]
async fn test_unref_below_zero_is_ignored() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let session = h.open(&profile).await;
    assert_eq!(session.unref(), 0);
    assert_eq!(session.unref(), 0);
    session.destroyed().await;
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_sticky() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let session = h.open(&profile).await;
    session.destroy();
    session.destroy();

    assert!(session.is_destroyed());
    assert_eq!(h.notifier.count(&SessionEvent::Destroyed), 1);

    // Subscribers that arrive late still see it
    tokio::time::timeout(Duration::from_millis(100), session.destroyed())
        .await
        .expect("destroyed() should resolve at once");
    assert!(*session.subscribe_destroyed().borrow());

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, SshSessionError::SessionDestroyed));
}

#[tokio::test]
async fn test_destroyed_session_is_not_handed_out() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let old = h.open(&profile).await;
    old.destroy();

    let new = h.multiplexer.get_or_create(&profile, true);
    assert_ne!(old.id(), new.id());
    new.start().await.unwrap();
    assert_eq!(h.transport.connect_count("web.internal"), 2);
}

#[tokio::test]
async fn test_sessions_snapshot() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let session = h.open(&profile).await;
    let _second = h.multiplexer.get_or_create(&profile, true);

    let infos = h.multiplexer.sessions();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, session.id());
    assert_eq!(infos[0].ref_count, 2);
    assert_eq!(infos[0].state, SessionState::Open);
    assert!(infos[0].jump_chain.is_empty());

    h.multiplexer.shutdown();
    assert!(session.is_destroyed());
    assert!(h.multiplexer.is_empty());
}

// =============================================================================
// Start
// =============================================================================

#[tokio::test]
async fn test_concurrent_start_connects_once() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            connect_delay: Some(Duration::from_millis(100)),
            ..HostScript::default()
        },
    );

    let a = h.multiplexer.get_or_create(&profile, true);
    let b = h.multiplexer.get_or_create(&profile, true);
    assert_eq!(a.state(), SessionState::Connecting);

    let (ra, rb) = tokio::join!(a.start(), b.start());
    ra.unwrap();
    rb.unwrap();

    assert!(a.is_open());
    assert_eq!(h.transport.connect_count("web.internal"), 1);
    assert_eq!(h.notifier.count(&SessionEvent::Opened), 1);
}

#[tokio::test]
async fn test_start_failure_reaches_every_waiter() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            fail_connect: true,
            ..HostScript::default()
        },
    );

    let a = h.multiplexer.get_or_create(&profile, true);
    let b = h.multiplexer.get_or_create(&profile, true);
    let (ra, rb) = tokio::join!(a.start(), b.start());

    assert!(matches!(ra, Err(SshSessionError::TransportError(_))));
    assert!(matches!(rb, Err(SshSessionError::TransportError(_))));
    assert!(a.is_destroyed());
    assert!(h.multiplexer.is_empty());
    assert_eq!(h.notifier.count(&SessionEvent::StartFailed), 1);
}

#[tokio::test]
async fn test_destroy_cancels_start_in_flight() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            hang_on_connect: true,
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    assert!(eventually(|| h.transport.connect_count("web.internal") == 1).await);
    session.destroy();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SshSessionError::Cancelled)));
}

#[tokio::test]
async fn test_transport_drop_destroys_session() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    let session = h.open(&profile).await;
    h.transport.drop_connections("web.internal", "connection reset by peer");

    tokio::time::timeout(Duration::from_secs(2), session.destroyed())
        .await
        .expect("session should be destroyed");
    assert!(h
        .notifier
        .message_texts()
        .iter()
        .any(|m| m == "web.internal: connection closed (connection reset by peer)"));
}

#[tokio::test]
async fn test_banner_is_forwarded_as_service_message() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            banner: Some("Authorized use only".to_string()),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut messages = session.subscribe_messages();
    session.start().await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.text, "Authorized use only");
    assert_eq!(message.session_id, session.id());
}

// =============================================================================
// Jump hosts
// =============================================================================

#[tokio::test]
async fn test_jump_host_tunnels_the_target() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);

    let session = h.open(&db).await;

    assert_eq!(
        h.transport.connects(),
        vec![
            ConnectRecord {
                host: "bastion.example.com".into(),
                port: 22,
                tunnelled: false
            },
            ConnectRecord {
                host: "10.0.0.5".into(),
                port: 22,
                tunnelled: true
            },
        ]
    );
    assert_eq!(
        h.transport.forwards(),
        vec![ForwardRecord {
            via: "bastion.example.com".into(),
            host: "10.0.0.5".into(),
            port: 22
        }]
    );

    let jump = h
        .multiplexer
        .find(&ConnectionIdentity::for_profile(&bastion, true))
        .expect("jump session registered");
    assert_eq!(jump.ref_count(), 1);
    assert_eq!(session.jump_chain(), vec![jump.id()]);
    assert_eq!(
        h.notifier.count(&SessionEvent::JumpAcquired {
            via: "bastion".into()
        }),
        1
    );
}

#[tokio::test]
async fn test_jump_host_shared_with_direct_tab() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);

    let direct = h.open(&bastion).await;
    let tunnelled = h.open(&db).await;

    assert_eq!(h.transport.connect_count("bastion.example.com"), 1);
    assert_eq!(direct.ref_count(), 2);
    assert_eq!(tunnelled.jump_chain(), vec![direct.id()]);
}

#[tokio::test]
async fn test_releasing_target_releases_jump() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);

    let session = h.open(&db).await;
    let jump = h
        .multiplexer
        .find(&ConnectionIdentity::for_profile(&bastion, true))
        .unwrap();

    session.unref();
    tokio::time::timeout(Duration::from_secs(1), jump.destroyed())
        .await
        .expect("jump should follow its last dependent");
    assert!(session.is_destroyed());
    assert!(h.multiplexer.is_empty());
}

#[tokio::test]
async fn test_jump_destroy_cascades_to_dependents() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);

    let direct = h.open(&bastion).await;
    let tunnelled = h.open(&db).await;

    direct.destroy();
    assert!(tunnelled.is_destroyed());
    assert!(h.multiplexer.is_empty());
}

#[tokio::test]
async fn test_jump_forward_refused() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);
    h.transport.script(
        "bastion.example.com",
        HostScript {
            refuse_forwarding: true,
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&db, true);
    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SshSessionError::JumpChannelFailed(_)));
    assert!(session.is_destroyed());
    assert_eq!(h.transport.connect_count("10.0.0.5"), 0);
    assert!(h
        .notifier
        .message_texts()
        .contains(&"Could not set up port forward on bastion".to_string()));

    assert!(
        eventually(|| h
            .multiplexer
            .find(&ConnectionIdentity::for_profile(&bastion, true))
            .is_none())
        .await
    );
}

#[tokio::test]
async fn test_jump_host_failure_fails_target() {
    let (bastion, db) = jump_pair();
    let h = Harness::new(vec![bastion.clone(), db.clone()]);
    h.transport.script(
        "bastion.example.com",
        HostScript {
            fail_connect: true,
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&db, true);
    let err = session.start().await.unwrap_err();

    assert!(matches!(err, SshSessionError::TransportError(_)));
    assert_eq!(h.transport.connect_count("10.0.0.5"), 0);
    assert!(h.multiplexer.is_empty());
}

#[tokio::test]
async fn test_unknown_jump_host() {
    let db = SshProfile::new("db", "10.0.0.5", "deploy").with_jump_host(Uuid::new_v4());
    let h = Harness::new(vec![db.clone()]);

    let err = h.multiplexer.get_or_create(&db, true).start().await.unwrap_err();
    assert!(matches!(err, SshSessionError::JumpHostUnresolved(_)));
    assert!(h.transport.connects().is_empty());
}

#[tokio::test]
async fn test_jump_cycle_is_rejected_before_connecting() {
    let mut a = SshProfile::new("a", "a.example.com", "ops");
    let b = SshProfile::new("b", "b.example.com", "ops").with_jump_host(a.id);
    a.jump_host = Some(b.id);
    let h = Harness::new(vec![a.clone(), b.clone()]);

    let err = h.multiplexer.get_or_create(&a, true).start().await.unwrap_err();
    match err {
        SshSessionError::JumpChainCycle(chain) => assert_eq!(chain, "a -> b -> a"),
        other => panic!("expected a cycle, got {:?}", other),
    }
    assert!(h.transport.connects().is_empty());
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_keyboard_interactive_rounds() {
    let profile = web().with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![
                (challenge(&[("Verification code: ", false)]), vec!["123456".into()]),
                (
                    challenge(&[("Token serial: ", true), ("PIN: ", false)]),
                    vec!["A1".into(), "0000".into()],
                ),
            ]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let first = prompts.recv().await.unwrap();
    assert_eq!(first.session_id, session.id());
    assert_eq!(first.prompts.len(), 1);
    assert!(!first.prompts[0].echo);
    assert!(session.outstanding_prompt().is_some());

    let err = first.respond(vec![]).unwrap_err();
    assert!(matches!(err, SshSessionError::InvalidResponseShape { expected: 1, got: 0 }));
    assert!(first.is_pending());
    first.respond(vec!["123456".into()]).unwrap();

    let second = prompts.recv().await.unwrap();
    assert_eq!(second.prompts.len(), 2);
    assert!(second.prompts[0].echo);
    second.respond(vec!["A1".into(), "0000".into()]).unwrap();

    starting.await.unwrap().unwrap();
    assert!(session.is_open());
    assert_eq!(
        h.notifier.count(&SessionEvent::AuthSuccess {
            method: "keyboard-interactive".into()
        }),
        1
    );
}

#[tokio::test]
async fn test_start_stays_pending_until_prompt_answered() {
    let profile = web().with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Code: ", true)]),
                vec!["42".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut start = tokio_test::task::spawn(session.start());
    assert_pending!(start.poll());

    let prompt = session.outstanding_prompt().expect("prompt published");
    prompt.respond(vec!["42".into()]).unwrap();

    assert!(start.is_woken());
    assert_ready!(start.poll()).unwrap();
    assert!(session.is_open());
}

#[tokio::test]
async fn test_wrong_keyboard_interactive_answer_fails() {
    let profile = web().with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Code: ", true)]),
                vec!["42".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    prompts.recv().await.unwrap().respond(vec!["41".into()]).unwrap();
    let err = starting.await.unwrap().unwrap_err();
    assert!(matches!(err, SshSessionError::AuthenticationFailed(_)));
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn test_destroy_cancels_outstanding_prompt() {
    let profile = web().with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Code: ", true)]),
                vec!["42".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let prompt = prompts.recv().await.unwrap();
    session.destroy();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SshSessionError::Cancelled)));
    assert!(!prompt.is_pending());
    assert!(matches!(
        prompt.respond(vec!["42".into()]),
        Err(SshSessionError::Cancelled)
    ));
    // The prompt stream closes with the session
    assert!(prompts.recv().await.is_err());
}

#[tokio::test]
async fn test_stored_profile_password_is_used() {
    let profile = web().with_password("hunter2");
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::Password("hunter2".into()),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    session.start().await.unwrap();

    assert!(prompts.try_recv().is_err());
    assert_eq!(h.transport.passwords_tried(), vec!["hunter2".to_string()]);
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialResolved {
            source: "profile".into()
        }),
        1
    );
}

#[tokio::test]
async fn test_password_prompt_and_runtime_cache() {
    let profile = web_without_password();
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::Password("s3cret".into()),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let prompt = prompts.recv().await.unwrap();
    assert!(prompt.is_password_prompt());
    assert_eq!(prompt.prompts[0].prompt, "Password for deploy@web.internal: ");
    prompt.respond(vec!["s3cret".into()]).unwrap();
    starting.await.unwrap().unwrap();
    assert_eq!(h.runtime.len(), 1);

    // A dedicated session to the same host reuses the typed password
    let dedicated = h.multiplexer.get_or_create(&profile, false);
    let mut prompts = dedicated.subscribe_prompts();
    dedicated.start().await.unwrap();
    assert!(prompts.try_recv().is_err());
    assert_eq!(
        h.transport.passwords_tried(),
        vec!["s3cret".to_string(), "s3cret".to_string()]
    );
}

#[tokio::test]
async fn test_rejected_stored_password_falls_back_to_prompt() {
    let profile = web_without_password();
    let h = Harness::new(vec![profile.clone()]);
    h.vault
        .set(SecretKind::Password, &profile.scope_key(), "stale")
        .await
        .unwrap();
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::Password("fresh".into()),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let mut messages = session.subscribe_messages();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let prompt = prompts.recv().await.unwrap();
    assert_eq!(messages.recv().await.unwrap().text, "Password rejected");
    prompt.respond(vec!["fresh".into()]).unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(
        h.transport.passwords_tried(),
        vec!["stale".to_string(), "fresh".to_string()]
    );
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialResolved { source: "vault".into() }),
        1
    );
}

#[tokio::test]
async fn test_password_prompts_are_bounded() {
    let profile = web_without_password();
    let mut settings = common::test_settings();
    settings.max_password_prompts = 2;
    let h = Harness::with_settings(vec![profile.clone()], settings);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::Password("right".into()),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    for _ in 0..2 {
        prompts.recv().await.unwrap().respond(vec!["wrong".into()]).unwrap();
    }
    let err = starting.await.unwrap().unwrap_err();
    assert!(matches!(err, SshSessionError::AuthenticationFailed(_)));
    assert_eq!(h.transport.passwords_tried().len(), 2);
    assert!(h.runtime.is_empty());
}

#[tokio::test]
async fn test_password_falls_back_to_keyboard_interactive_with_auto_fill() {
    let profile = web().with_password("pw");
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Password: ", false)]),
                vec!["pw".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    session.start().await.unwrap();

    // The lone password challenge was answered from the stored credential
    assert!(prompts.try_recv().is_err());
    assert!(session.is_open());
}

#[tokio::test]
async fn test_jump_prompt_is_relayed_to_target() {
    let (bastion, db) = jump_pair();
    let bastion = bastion.with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![bastion.clone(), db.clone()]);
    h.transport.script(
        "bastion.example.com",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Duo passcode: ", true)]),
                vec!["999".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&db, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let prompt = prompts.recv().await.unwrap();
    assert_ne!(prompt.session_id, session.id());
    prompt.respond(vec!["999".into()]).unwrap();

    starting.await.unwrap().unwrap();
    assert!(session.is_open());
}

#[tokio::test]
async fn test_second_challenge_while_prompt_outstanding_destroys_session() {
    let profile = web().with_auth_method(AuthMethod::KeyboardInteractive);
    let h = Harness::new(vec![profile.clone()]);
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::KeyboardInteractive(vec![(
                challenge(&[("Verification code: ", false)]),
                vec!["123456".into()],
            )]),
            ..HostScript::default()
        },
    );

    let session = h.multiplexer.get_or_create(&profile, true);
    let mut prompts = session.subscribe_prompts();
    let starting = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };

    let first = prompts.recv().await.unwrap();
    assert!(first.is_pending());
    h.transport
        .send_challenge("web.internal", challenge(&[("Second factor: ", false)]));

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(SshSessionError::ConcurrentPromptViolation)));
    assert!(session.is_destroyed());
    assert!(first.respond(vec!["123456".into()]).is_err());
    assert!(h.multiplexer.find(session.identity()).is_none());
    assert_eq!(h.notifier.count(&SessionEvent::StartFailed), 1);

    // Later callers see the same failure
    assert!(matches!(
        session.start().await,
        Err(SshSessionError::ConcurrentPromptViolation)
    ));
}

#[tokio::test]
async fn test_challenge_outside_authentication_is_ignored() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);
    let session = h.open(&profile).await;

    h.transport
        .send_challenge("web.internal", challenge(&[("Code: ", true)]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.is_open());
    assert!(session.outstanding_prompt().is_none());
}

// =============================================================================
// Plaintext password migration
// =============================================================================

#[tokio::test]
async fn test_profile_password_moves_to_vault_after_login() {
    let profile = web();
    let h = Harness::with_migration(vec![profile.clone()], true);

    let session = h.open(&profile).await;
    assert!(session.is_open());

    let stored = h.profiles.get_profile(profile.id).unwrap().unwrap();
    assert!(stored.password.is_none());
    assert_eq!(
        h.vault.get(SecretKind::Password, &profile.scope_key()).await.unwrap(),
        Some("pw".to_string())
    );
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialMigrated { to: "vault".into() }),
        1
    );

    // A dedicated session now finds the password in the vault
    let dedicated = h.multiplexer.get_or_create(&stored, false);
    dedicated.start().await.unwrap();
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialResolved { source: "vault".into() }),
        1
    );
}

#[tokio::test]
async fn test_profile_password_moves_to_keychain_after_login() {
    let profile = web();
    let h = Harness::with_migration(vec![profile.clone()], false);

    h.open(&profile).await;

    assert!(h.profiles.get_profile(profile.id).unwrap().unwrap().password.is_none());
    assert_eq!(
        h.keychain.get(SecretKind::Password, &profile.scope_key()).await.unwrap(),
        Some("pw".to_string())
    );
    assert!(h.vault.is_empty());
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialMigrated { to: "keychain".into() }),
        1
    );
}

#[tokio::test]
async fn test_keychain_hit_clears_plaintext_copy() {
    let profile = web_without_password().with_password("old-copy");
    let h = Harness::with_migration(vec![profile.clone()], false);
    h.keychain
        .set(SecretKind::Password, &profile.scope_key(), "pw")
        .await
        .unwrap();
    h.transport.script(
        "web.internal",
        HostScript {
            auth: AuthScript::Password("pw".into()),
            ..HostScript::default()
        },
    );

    h.open(&profile).await;

    assert_eq!(h.transport.passwords_tried(), vec!["pw".to_string()]);
    assert!(h.profiles.get_profile(profile.id).unwrap().unwrap().password.is_none());
}

#[tokio::test]
async fn test_plaintext_kept_without_password_storage() {
    let profile = web();
    let h = Harness::new(vec![profile.clone()]);

    h.open(&profile).await;

    assert_eq!(
        h.profiles.get_profile(profile.id).unwrap().unwrap().password.as_deref(),
        Some("pw")
    );
    assert_eq!(
        h.notifier.count(&SessionEvent::CredentialMigrated { to: "vault".into() }),
        0
    );
}
