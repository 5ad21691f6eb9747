use super::*;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::auth::{SignIn, SignUp};
use crate::notify::Variant;
use crate::profile::ProfileStoreError;
use crate::types::SessionEventKind;

const WAIT: Duration = Duration::from_secs(2);

// =============================================================================
// Fixtures
// =============================================================================

fn user(n: u128, email: &str) -> User {
    User { id: Uuid::from_u128(n), email: Some(email.to_owned()), metadata: UserMetadata::default() }
}

fn session_for(user: &User) -> Session {
    Session {
        access_token: format!("access-{}", user.id),
        refresh_token: format!("refresh-{}", user.id),
        token_type: "bearer".into(),
        expires_in: Some(3600),
        expires_at: None,
        user: user.clone(),
    }
}

fn profile_for(user: &User, username: &str) -> Profile {
    let mut profile = Profile::empty(user.id);
    profile.username = Some(username.to_owned());
    profile
}

// =============================================================================
// Mock auth provider
// =============================================================================

struct MockAuth {
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Option<Session>>,
    /// When set, `current_session` waits for a permit before answering.
    snapshot_gate: Option<Arc<Notify>>,
    snapshot_fails: AtomicBool,
    /// Message returned by the next request, if any.
    fail_next: Mutex<Option<String>>,
    sign_up_user: Mutex<Option<User>>,
    calls: Mutex<Vec<String>>,
}

impl MockAuth {
    fn new(session: Option<Session>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            session: Mutex::new(session),
            snapshot_gate: None,
            snapshot_fails: AtomicBool::new(false),
            fail_next: Mutex::new(None),
            sign_up_user: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn gated(session: Option<Session>, gate: Arc<Notify>) -> Self {
        Self { snapshot_gate: Some(gate), ..Self::new(session) }
    }

    fn emit(&self, kind: SessionEventKind, session: Option<Session>) {
        self.publish(SessionEvent { kind, session });
    }

    fn publish(&self, event: SessionEvent) {
        self.session.lock().unwrap().clone_from(&event.session);
        let _ = self.events.send(event);
    }

    fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_owned());
    }

    fn take_failure(&self) -> Result<(), AuthProviderError> {
        match self.fail_next.lock().unwrap().take() {
            Some(message) => Err(AuthProviderError::Api { status: 400, message }),
            None => Ok(()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.calls.lock().unwrap().push("subscribe".into());
        self.events.subscribe()
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthProviderError> {
        self.calls.lock().unwrap().push("current_session".into());
        let snapshot = self.session.lock().unwrap().clone();
        if let Some(gate) = &self.snapshot_gate {
            gate.notified().await;
        }
        if self.snapshot_fails.load(Ordering::SeqCst) {
            return Err(AuthProviderError::Request("offline".into()));
        }
        Ok(snapshot)
    }

    async fn request_magic_link(&self, email: &str, redirect_to: Option<&str>) -> Result<(), AuthProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("magic_link:{email}:{}", redirect_to.unwrap_or("-")));
        self.take_failure()
    }

    async fn sign_in_with_password(&self, email: &str, _password: &str) -> Result<SignIn, AuthProviderError> {
        self.calls.lock().unwrap().push(format!("password:{email}"));
        self.take_failure()?;
        let user = user(1, email);
        let session = session_for(&user);
        self.publish(SessionEvent::signed_in(session.clone()));
        Ok(SignIn { user, session })
    }

    async fn sign_out(&self) -> Result<(), AuthProviderError> {
        self.calls.lock().unwrap().push("sign_out".into());
        self.take_failure()?;
        self.publish(SessionEvent::signed_out());
        Ok(())
    }

    async fn sign_up(&self, email: &str, _password: &str, options: &SignUpOptions) -> Result<SignUp, AuthProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("sign_up:{email}:{}", options.redirect_to.as_deref().unwrap_or("-")));
        self.take_failure()?;
        Ok(SignUp { user: self.sign_up_user.lock().unwrap().clone(), session: None })
    }
}

// =============================================================================
// Mock profile store
// =============================================================================

#[derive(Default)]
struct MockProfiles {
    rows: Mutex<HashMap<Uuid, Profile>>,
    select_gate: Option<Arc<Notify>>,
    /// Read the row before waiting on `select_gate`, like a response already in flight.
    read_before_gate: bool,
    fail_select: AtomicBool,
    fail_update: AtomicBool,
    select_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl MockProfiles {
    fn with(profiles: Vec<Profile>) -> Self {
        let rows = profiles.into_iter().map(|p| (p.id, p)).collect();
        Self { rows: Mutex::new(rows), ..Self::default() }
    }

    fn gated(profiles: Vec<Profile>, gate: Arc<Notify>) -> Self {
        Self { select_gate: Some(gate), ..Self::with(profiles) }
    }

    fn gated_after_read(profiles: Vec<Profile>, gate: Arc<Notify>) -> Self {
        Self { read_before_gate: true, ..Self::gated(profiles, gate) }
    }
}

#[async_trait]
impl ProfileStore for MockProfiles {
    async fn select_profile_by_id(&self, id: Uuid) -> Result<Profile, ProfileStoreError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        let early = if self.read_before_gate { self.rows.lock().unwrap().get(&id).cloned() } else { None };
        if let Some(gate) = &self.select_gate {
            gate.notified().await;
        }
        if self.fail_select.load(Ordering::SeqCst) {
            return Err(ProfileStoreError::Request("connection reset".into()));
        }
        match early {
            Some(row) => Ok(row),
            None => self.rows.lock().unwrap().get(&id).cloned().ok_or(ProfileStoreError::NotFound(id)),
        }
    }

    async fn update_profile_by_id(&self, id: Uuid, fields: &ProfileUpdate) -> Result<(), ProfileStoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(ProfileStoreError::Api { status: 409, message: "username taken".into() });
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(ProfileStoreError::NotFound(id))?;
        row.apply(fields);
        Ok(())
    }
}

// =============================================================================
// Recording notifier
// =============================================================================

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    fn last(&self) -> Notification {
        self.seen.lock().unwrap().last().cloned().expect("a notification")
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    auth: Arc<MockAuth>,
    profiles: Arc<MockProfiles>,
    notes: Arc<RecordingNotifier>,
    manager: SessionManager,
}

fn mount(auth: MockAuth, profiles: MockProfiles) -> Harness {
    let auth = Arc::new(auth);
    let profiles = Arc::new(profiles);
    let notes = Arc::new(RecordingNotifier::default());
    let config = SessionConfig { redirect_url: Some("https://songbook.test/welcome".into()) };
    let manager = SessionManager::mount(auth.clone(), profiles.clone(), notes.clone(), config);
    Harness { auth, profiles, notes, manager }
}

async fn wait_until(manager: &SessionManager, pred: impl FnMut(&AuthState) -> bool) -> AuthState {
    let mut rx = manager.watch();
    let state = tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("state condition not reached in time")
        .expect("state channel closed");
    (*state).clone()
}

/// Let spawned tasks run to quiescence.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// =============================================================================
// Mount lifecycle
// =============================================================================

#[tokio::test]
async fn mount_with_existing_session_loads_user_then_profile() {
    let u1 = user(1, "u1@songbook.test");
    let p1 = profile_for(&u1, "p1");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![p1.clone()]));

    let state = wait_until(&h.manager, |s| !s.is_loading && s.profile.is_some()).await;
    assert_eq!(state.user, Some(u1));
    assert_eq!(state.profile, Some(p1));
    assert_eq!(state.phase(), SessionPhase::Authenticated);
}

#[tokio::test]
async fn mount_subscribes_before_requesting_snapshot() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    let calls = h.auth.calls();
    let subscribe = calls.iter().position(|c| c == "subscribe").unwrap();
    let snapshot = calls.iter().position(|c| c == "current_session").unwrap();
    assert!(subscribe < snapshot);
}

#[tokio::test]
async fn mount_without_session_is_unauthenticated_and_skips_profile_fetch() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    let state = h.manager.ready().await;
    settle().await;
    assert_eq!(state.phase(), SessionPhase::Unauthenticated);
    assert!(state.profile.is_none());
    assert_eq!(h.profiles.select_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_initial_check_still_ends_loading() {
    let auth = MockAuth::new(None);
    auth.snapshot_fails.store(true, Ordering::SeqCst);
    let h = mount(auth, MockProfiles::default());
    let state = h.manager.ready().await;
    assert!(!state.is_loading);
    assert!(state.user.is_none());
}

#[tokio::test]
async fn loading_ends_exactly_once_across_many_notifications() {
    let gate = Arc::new(Notify::new());
    let h = mount(MockAuth::gated(None, gate.clone()), MockProfiles::default());
    let mut rx = h.manager.watch();

    let observer = tokio::spawn(async move {
        let mut seen = vec![rx.borrow_and_update().is_loading];
        while tokio::time::timeout(Duration::from_millis(200), rx.changed()).await.is_ok_and(|r| r.is_ok()) {
            seen.push(rx.borrow_and_update().is_loading);
        }
        seen
    });

    let u1 = user(1, "u1@songbook.test");
    h.auth.emit(SessionEventKind::SignedIn, Some(session_for(&u1)));
    settle().await;
    assert!(h.manager.is_loading());

    gate.notify_one();
    h.manager.ready().await;
    for _ in 0..3 {
        h.auth.emit(SessionEventKind::TokenRefreshed, Some(session_for(&u1)));
        h.auth.emit(SessionEventKind::SignedOut, None);
    }

    let seen = observer.await.unwrap();
    let first_done = seen.iter().position(|loading| !loading).expect("loading finished");
    assert!(seen[..first_done].iter().all(|loading| *loading));
    assert!(seen[first_done..].iter().all(|loading| !loading));
}

#[tokio::test]
async fn stale_snapshot_does_not_override_newer_notification() {
    let gate = Arc::new(Notify::new());
    let u1 = user(1, "u1@songbook.test");
    let u2 = user(2, "u2@songbook.test");
    let h = mount(
        MockAuth::gated(Some(session_for(&u1)), gate.clone()),
        MockProfiles::with(vec![profile_for(&u1, "one"), profile_for(&u2, "two")]),
    );

    // Snapshot already captured u1; a newer sign-in for u2 lands first.
    settle().await;
    h.auth.emit(SessionEventKind::SignedIn, Some(session_for(&u2)));
    wait_until(&h.manager, |s| s.user.as_ref().map(|u| u.id) == Some(u2.id)).await;

    gate.notify_one();
    let state = h.manager.ready().await;
    settle().await;
    assert_eq!(state.user.as_ref().map(|u| u.id), Some(u2.id));
    assert_eq!(h.manager.profile().and_then(|p| p.username).as_deref(), Some("two"));
}

#[tokio::test]
async fn unmount_stops_following_notifications() {
    let mut h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    h.manager.unmount();
    assert!(!h.manager.is_mounted());
    settle().await;

    h.auth.emit(SessionEventKind::SignedIn, Some(session_for(&user(1, "u1@songbook.test"))));
    settle().await;
    assert!(h.manager.user().is_none());
}

// =============================================================================
// Session notifications
// =============================================================================

#[tokio::test]
async fn profile_is_never_set_without_user() {
    let u1 = user(1, "u1@songbook.test");
    let u2 = user(2, "u2@songbook.test");
    let h = mount(
        MockAuth::new(None),
        MockProfiles::with(vec![profile_for(&u1, "one"), profile_for(&u2, "two")]),
    );
    h.manager.ready().await;

    let mut rx = h.manager.watch();
    let checker = tokio::spawn(async move {
        let mut violations = 0;
        while tokio::time::timeout(Duration::from_millis(200), rx.changed()).await.is_ok_and(|r| r.is_ok()) {
            let state = rx.borrow_and_update();
            if state.user.is_none() && state.profile.is_some() {
                violations += 1;
            }
        }
        violations
    });

    let sequence = [
        (SessionEventKind::SignedIn, Some(session_for(&u1))),
        (SessionEventKind::SignedOut, None),
        (SessionEventKind::SignedIn, Some(session_for(&u2))),
        (SessionEventKind::TokenRefreshed, Some(session_for(&u2))),
        (SessionEventKind::SignedOut, None),
        (SessionEventKind::SignedIn, Some(session_for(&u1))),
    ];
    for (kind, session) in sequence {
        h.auth.emit(kind, session);
        settle().await;
        let state = h.manager.state();
        assert!(state.user.is_some() || state.profile.is_none(), "profile without user after {kind:?}");
    }

    assert_eq!(checker.await.unwrap(), 0);
    assert_eq!(h.manager.profile().and_then(|p| p.username).as_deref(), Some("one"));
}

#[tokio::test]
async fn signed_out_notification_clears_profile() {
    let u1 = user(1, "u1@songbook.test");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![profile_for(&u1, "one")]));
    wait_until(&h.manager, |s| s.profile.is_some()).await;

    h.auth.emit(SessionEventKind::SignedOut, None);
    let state = wait_until(&h.manager, |s| s.user.is_none()).await;
    assert!(state.profile.is_none());
}

#[tokio::test]
async fn profile_fetch_resolving_after_sign_out_is_dropped() {
    let gate = Arc::new(Notify::new());
    let u1 = user(1, "u1@songbook.test");
    let h = mount(MockAuth::new(None), MockProfiles::gated(vec![profile_for(&u1, "one")], gate.clone()));
    h.manager.ready().await;

    h.auth.emit(SessionEventKind::SignedIn, Some(session_for(&u1)));
    wait_until(&h.manager, |s| s.user.is_some()).await;
    h.auth.emit(SessionEventKind::SignedOut, None);
    wait_until(&h.manager, |s| s.user.is_none()).await;

    gate.notify_one();
    settle().await;
    assert!(h.manager.profile().is_none());
}

#[tokio::test]
async fn profile_fetch_failure_leaves_profile_empty() {
    let u1 = user(1, "u1@songbook.test");
    let profiles = MockProfiles::with(vec![profile_for(&u1, "one")]);
    profiles.fail_select.store(true, Ordering::SeqCst);
    let h = mount(MockAuth::new(Some(session_for(&u1))), profiles);

    let state = h.manager.ready().await;
    settle().await;
    assert_eq!(state.user, Some(u1));
    assert!(h.manager.profile().is_none());
    assert!(h.notes.all().is_empty());
}

// =============================================================================
// sign_in / sign_in_with_password
// =============================================================================

#[tokio::test]
async fn sign_in_requests_magic_link_and_notifies() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    let before = h.manager.ready().await;

    h.manager.sign_in("a@b.com").await.unwrap();

    assert!(h.auth.calls().contains(&"magic_link:a@b.com:https://songbook.test/welcome".to_owned()));
    assert_eq!(h.notes.last().title, "Check your email");
    assert_eq!(h.manager.state(), before);
}

#[tokio::test]
async fn sign_in_failure_propagates_without_notification() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    h.auth.fail_next("Email rate limit exceeded");

    let err = h.manager.sign_in("a@b.com").await.unwrap_err();
    assert!(matches!(err, SessionError::AuthRequest(AuthProviderError::Api { .. })));
    assert_eq!(err.to_string(), "Email rate limit exceeded");
    assert!(h.notes.all().is_empty());
}

#[tokio::test]
async fn password_sign_in_notifies_and_state_follows_subscription() {
    let signed_in_user = user(1, "a@b.com");
    let h = mount(MockAuth::new(None), MockProfiles::with(vec![profile_for(&signed_in_user, "ana")]));
    h.manager.ready().await;

    let returned = h.manager.sign_in_with_password("a@b.com", "pw").await.unwrap();
    assert_eq!(returned.id, signed_in_user.id);

    let note = h.notes.last();
    assert_eq!(note.title, "Signed in");
    assert!(note.description.unwrap().contains("a@b.com"));

    let state = wait_until(&h.manager, |s| s.profile.is_some()).await;
    assert_eq!(state.user.map(|u| u.id), Some(signed_in_user.id));
}

#[tokio::test]
async fn password_sign_in_failure_propagates() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    h.auth.fail_next("Invalid login credentials");

    let err = h.manager.sign_in_with_password("a@b.com", "nope").await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid login credentials");
    settle().await;
    assert!(h.manager.user().is_none());
}

// =============================================================================
// sign_out
// =============================================================================

#[tokio::test]
async fn sign_out_success_clears_user_and_profile() {
    let u1 = user(1, "u1@songbook.test");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![profile_for(&u1, "one")]));
    wait_until(&h.manager, |s| s.profile.is_some()).await;

    h.manager.sign_out().await;

    let state = h.manager.state();
    assert!(state.user.is_none());
    assert!(state.profile.is_none());
    assert_eq!(h.notes.last().title, "Signed out");
}

#[tokio::test]
async fn sign_out_failure_keeps_state_and_reports_error() {
    let u1 = user(1, "u1@songbook.test");
    let p1 = profile_for(&u1, "one");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![p1.clone()]));
    wait_until(&h.manager, |s| s.profile.is_some()).await;
    h.auth.fail_next("network unreachable");

    h.manager.sign_out().await;

    assert_eq!(h.manager.user(), Some(u1));
    assert_eq!(h.manager.profile(), Some(p1));
    let note = h.notes.last();
    assert_eq!(note.title, "Error signing out");
    assert_eq!(note.description.as_deref(), Some("network unreachable"));
    assert_eq!(note.variant, Variant::Destructive);
}

// =============================================================================
// sign_up
// =============================================================================

#[tokio::test]
async fn sign_up_without_user_asks_to_check_email() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;

    let created = h.manager.sign_up("a@b.com", "pw").await.unwrap();

    assert!(created.is_none());
    assert_eq!(h.notes.last().description.as_deref(), Some("Please check your email for a verification link."));
    assert!(h.auth.calls().contains(&"sign_up:a@b.com:https://songbook.test/welcome".to_owned()));
}

#[tokio::test]
async fn sign_up_with_user_asks_to_verify_and_returns_user() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    let new_user = user(9, "a@b.com");
    *h.auth.sign_up_user.lock().unwrap() = Some(new_user.clone());

    let created = h.manager.sign_up("a@b.com", "pw").await.unwrap();

    assert_eq!(created, Some(new_user));
    let note = h.notes.last();
    assert_eq!(note.title, "Verify your email");
    assert_ne!(note.description.as_deref(), Some(VERIFY_LINK_MESSAGE));
}

#[tokio::test]
async fn sign_up_failure_propagates() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    h.auth.fail_next("User already registered");

    let err = h.manager.sign_up("a@b.com", "pw").await.unwrap_err();
    assert!(matches!(err, SessionError::AuthRequest(_)));
    assert!(h.notes.all().is_empty());
}

// =============================================================================
// get_profile
// =============================================================================

#[tokio::test]
async fn get_profile_without_user_makes_no_request() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;
    settle().await;

    assert!(h.manager.get_profile().await.is_none());
    assert_eq!(h.profiles.select_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn get_profile_returns_row_for_current_user() {
    let u1 = user(1, "u1@songbook.test");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![profile_for(&u1, "one")]));
    h.manager.ready().await;

    let profile = h.manager.get_profile().await.unwrap();
    assert_eq!(profile.id, u1.id);
}

#[tokio::test]
async fn get_profile_not_found_yields_none() {
    let u1 = user(1, "u1@songbook.test");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::default());
    h.manager.ready().await;

    assert!(h.manager.get_profile().await.is_none());
}

// =============================================================================
// update_profile
// =============================================================================

#[tokio::test]
async fn update_profile_without_user_is_rejected_before_store() {
    let h = mount(MockAuth::new(None), MockProfiles::default());
    h.manager.ready().await;

    let err = h.manager.update_profile(&ProfileUpdate::default().bio("c")).await.unwrap_err();
    assert!(matches!(err, SessionError::NotAuthenticated));
    assert_eq!(h.profiles.update_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn update_profile_merges_only_supplied_fields() {
    let u1 = user(1, "u1@songbook.test");
    let mut existing = profile_for(&u1, "a");
    existing.bio = Some("b".into());
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![existing]));
    wait_until(&h.manager, |s| s.profile.is_some()).await;

    h.manager.update_profile(&ProfileUpdate::default().bio("c")).await.unwrap();

    let profile = h.manager.profile().unwrap();
    assert_eq!(profile.username.as_deref(), Some("a"));
    assert_eq!(profile.bio.as_deref(), Some("c"));
    assert_eq!(h.notes.last().title, "Profile updated");
}

#[tokio::test]
async fn fetch_in_flight_before_update_does_not_revert_merge() {
    let u1 = user(1, "u1@songbook.test");
    let mut existing = profile_for(&u1, "a");
    existing.bio = Some("b".into());
    let gate = Arc::new(Notify::new());
    let h = mount(
        MockAuth::new(Some(session_for(&u1))),
        MockProfiles::gated_after_read(vec![existing], gate.clone()),
    );
    gate.notify_one();
    wait_until(&h.manager, |s| s.profile.is_some()).await;

    // Token refresh starts a fetch that reads the pre-write row and stalls.
    h.auth.emit(SessionEventKind::TokenRefreshed, Some(session_for(&u1)));
    settle().await;
    assert_eq!(h.profiles.select_calls.load(Ordering::SeqCst), 2);

    h.manager.update_profile(&ProfileUpdate::default().bio("c")).await.unwrap();
    assert_eq!(h.manager.profile().unwrap().bio.as_deref(), Some("c"));

    gate.notify_one();
    settle().await;
    let profile = h.manager.profile().unwrap();
    assert_eq!(profile.bio.as_deref(), Some("c"));
    assert_eq!(profile.username.as_deref(), Some("a"));
}

#[tokio::test]
async fn update_without_cached_profile_refetches_written_row() {
    let u1 = user(1, "u1@songbook.test");
    let mut existing = profile_for(&u1, "a");
    existing.bio = Some("b".into());
    let gate = Arc::new(Notify::new());
    let h = mount(
        MockAuth::new(Some(session_for(&u1))),
        MockProfiles::gated_after_read(vec![existing], gate.clone()),
    );
    wait_until(&h.manager, |s| s.user.is_some()).await;
    settle().await;
    assert!(h.manager.profile().is_none());

    h.manager.update_profile(&ProfileUpdate::default().bio("c")).await.unwrap();
    assert!(h.manager.profile().is_none());

    // Release both the pre-write fetch and the refetch issued by the update.
    settle().await;
    assert_eq!(h.profiles.select_calls.load(Ordering::SeqCst), 2);
    gate.notify_waiters();
    settle().await;
    let state = wait_until(&h.manager, |s| s.profile.is_some()).await;
    assert_eq!(state.profile.unwrap().bio.as_deref(), Some("c"));
}

#[tokio::test]
async fn update_profile_failure_leaves_cache_untouched() {
    let u1 = user(1, "u1@songbook.test");
    let existing = profile_for(&u1, "a");
    let h = mount(MockAuth::new(Some(session_for(&u1))), MockProfiles::with(vec![existing.clone()]));
    wait_until(&h.manager, |s| s.profile.is_some()).await;
    h.profiles.fail_update.store(true, Ordering::SeqCst);

    h.manager.update_profile(&ProfileUpdate::default().username("z")).await.unwrap();

    assert_eq!(h.manager.profile(), Some(existing));
    let note = h.notes.last();
    assert_eq!(note.title, "Error updating profile");
    assert_eq!(note.variant, Variant::Destructive);
    assert_eq!(note.description.as_deref(), Some("username taken"));
}
