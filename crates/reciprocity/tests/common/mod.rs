//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use reciprocity::events::{EventReceiver, Observed, RunEvent};
use reciprocity::source::{MemorySource, Profile, SessionToken};
use reciprocity::{
    AccountClient, ClientFactory, Config, Direction, Entity, FsStore, ItemSource, LoginError,
    RunDispatcher, SourceError,
};

/// How the scripted client answers a password login.
#[derive(Debug, Clone)]
pub enum LoginBehavior {
    Accept,
    TwoFactor { accepted_code: String },
    Reject(LoginError),
}

/// Account client that replays fixed lists.
pub struct ScriptedClient {
    pub following: Vec<Result<Entity, SourceError>>,
    pub followers: Vec<Result<Entity, SourceError>>,
    pub login: LoginBehavior,
    pub profile_delay: Option<Duration>,
    /// Answers for the next profile lookups, before the profile itself.
    pub profile_errors: Mutex<VecDeque<LoginError>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(following: &[&str], followers: &[&str]) -> Self {
        Self {
            following: entities(following),
            followers: entities(followers),
            login: LoginBehavior::Accept,
            profile_delay: None,
            profile_errors: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_login(mut self, login: LoginBehavior) -> Self {
        self.login = login;
        self
    }

    pub fn with_profile_delay(mut self, delay: Duration) -> Self {
        self.profile_delay = Some(delay);
        self
    }

    pub fn with_profile_errors(self, errors: Vec<LoginError>) -> Self {
        *self.profile_errors.lock() = errors.into();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

pub fn entities(ids: &[&str]) -> Vec<Result<Entity, SourceError>> {
    ids.iter()
        .map(|id| Ok(Entity::new(*id, id.to_uppercase())))
        .collect()
}

#[async_trait]
impl AccountClient for ScriptedClient {
    async fn login(&self, handle: &str, _password: &str) -> Result<SessionToken, LoginError> {
        self.record(format!("login:{handle}"));
        match &self.login {
            LoginBehavior::Accept => Ok(SessionToken::new(format!("tok-{handle}"))),
            LoginBehavior::TwoFactor { .. } => Err(LoginError::TwoFactorRequired),
            LoginBehavior::Reject(err) => Err(err.clone()),
        }
    }

    async fn two_factor_login(
        &self,
        handle: &str,
        code: &str,
    ) -> Result<SessionToken, LoginError> {
        self.record(format!("two_factor:{code}"));
        match &self.login {
            LoginBehavior::TwoFactor { accepted_code } if accepted_code == code => {
                Ok(SessionToken::new(format!("tok-{handle}")))
            }
            _ => Err(LoginError::BadCredentials("invalid code".into())),
        }
    }

    async fn restore_session(&self, handle: &str, token: &SessionToken) -> Result<(), LoginError> {
        self.record(format!("restore:{handle}:{}", token.expose()));
        Ok(())
    }

    async fn profile(&self, handle: &str) -> Result<Profile, LoginError> {
        self.record(format!("profile:{handle}"));
        if let Some(err) = self.profile_errors.lock().pop_front() {
            return Err(err);
        }
        if let Some(delay) = self.profile_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Profile {
            handle: handle.to_string(),
            following_count: Some(self.following.len() as u64),
            followers_count: Some(self.followers.len() as u64),
        })
    }

    fn relations(
        &self,
        _handle: &str,
        direction: Direction,
        expected_total: Option<u64>,
        _fetch_avatars: bool,
    ) -> Box<dyn ItemSource> {
        let steps = match direction {
            Direction::Following => self.following.clone(),
            Direction::Followers => self.followers.clone(),
        };
        Box::new(MemorySource::scripted(steps, expected_total))
    }
}

/// Hands out the same scripted client for every run.
pub struct ScriptedFactory(pub Arc<ScriptedClient>);

impl ClientFactory for ScriptedFactory {
    fn create(&self) -> Arc<dyn AccountClient> {
        Arc::clone(&self.0) as Arc<dyn AccountClient>
    }
}

/// Config with no settle pause.
pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::with_data_dir(data_dir);
    config.settle_delay = Duration::ZERO;
    config.legacy_exports = false;
    config
}

/// Dispatcher over a temp store and a scripted client.
pub fn dispatcher(data_dir: &Path, client: ScriptedClient) -> (RunDispatcher, Arc<ScriptedClient>) {
    dispatcher_with(test_config(data_dir), client)
}

pub fn dispatcher_with(config: Config, client: ScriptedClient) -> (RunDispatcher, Arc<ScriptedClient>) {
    let client = Arc::new(client);
    let store = FsStore::new(&config.data_dir).with_legacy_exports(config.legacy_exports);
    let dispatcher = RunDispatcher::new(
        Arc::new(store),
        Arc::new(ScriptedFactory(Arc::clone(&client))),
        config,
    );
    (dispatcher, client)
}

/// Read events until the channel ends. The last element is the terminal
/// event, or `None` if the channel closed without one.
pub async fn drain(mut receiver: EventReceiver) -> (Vec<RunEvent>, Option<RunEvent>) {
    let mut events = Vec::new();
    while let Some(observed) = receiver.next().await {
        match observed {
            Observed::Event(event) => events.push(event),
            Observed::Terminal(event) => return (events, Some(event)),
            Observed::Disconnected => break,
        }
    }
    (events, None)
}

pub fn logs(events: &[RunEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Log { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
