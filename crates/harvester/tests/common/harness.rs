//! Test harness and scraper doubles.
//!
//! Tests run on a paused tokio clock; `InstantClock` follows it, so
//! cooldowns and backoffs elapse instantly while staying consistent with
//! the timestamps stored in the database.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use harvester::accounts::{
    Account, AccountCredentials, AccountHealthStore, AccountRotator, DbCredentialStore,
    HealthPolicy,
};
use harvester::broadcast::JobProgressBroadcaster;
use harvester::clock::{Clock, InstantClock};
use harvester::config::{AccountsConfig, DispatchConfig, RetryConfig};
use harvester::db::{account_repo, job_url_repo, Database};
use harvester::dispatch::{DispatchSettings, UrlDispatcher};
use harvester::jobs::{Job, JobService, JobUrl, NewJob};
use harvester::results::{CompanyRecord, ProfileRecord, ScrapeRecord};
use harvester::retry::RetryPolicy;
use harvester::scheduler::{Scheduler, SchedulerSettings};
use harvester::scraper::{ScrapeFailure, ScrapeKind, ScrapeSuccess, Scraper};
use harvester::secrets::CookieCipher;

/// One call the scraper received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub account_id: String,
}

fn success_for(url: &str, kind: ScrapeKind) -> ScrapeSuccess {
    let slug = url.rsplit('/').next().unwrap_or(url).to_string();
    let record = match kind {
        ScrapeKind::Profile => ScrapeRecord::Profile(ProfileRecord {
            full_name: Some(format!("Person {}", slug)),
            headline: Some("Engineer".to_string()),
            ..Default::default()
        }),
        ScrapeKind::Company => ScrapeRecord::Company(CompanyRecord {
            name: Some(format!("Company {}", slug)),
            ..Default::default()
        }),
    };
    ScrapeSuccess {
        record,
        raw_payload: Some(format!("<html>{}</html>", slug)),
    }
}

/// Scraper that succeeds unless told otherwise.
///
/// Failures can be pinned to an account, pinned to a URL, or queued for the
/// next calls on a URL.
#[derive(Default)]
pub struct ScriptedScraper {
    account_failures: Mutex<HashMap<String, ScrapeFailure>>,
    url_failures: Mutex<HashMap<String, ScrapeFailure>>,
    queued: Mutex<HashMap<String, VecDeque<ScrapeFailure>>>,
    search_results: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    panic_url: Mutex<Option<String>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedScraper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_account(&self, account_id: &str, failure: ScrapeFailure) {
        self.account_failures
            .lock()
            .unwrap()
            .insert(account_id.to_string(), failure);
    }

    pub fn fail_url(&self, url: &str, failure: ScrapeFailure) {
        self.url_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), failure);
    }

    /// Fails the next calls on `url` in order, then succeeds.
    pub fn fail_next(&self, url: &str, failures: Vec<ScrapeFailure>) {
        self.queued
            .lock()
            .unwrap()
            .insert(url.to_string(), failures.into());
    }

    pub fn clear_failures(&self) {
        self.account_failures.lock().unwrap().clear();
        self.url_failures.lock().unwrap().clear();
        self.queued.lock().unwrap().clear();
    }

    /// Every scrape takes `latency` on the (paused) clock before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Scraping `url` panics instead of answering.
    pub fn panic_on(&self, url: &str) {
        *self.panic_url.lock().unwrap() = Some(url.to_string());
    }

    pub fn set_search_results(&self, urls: Vec<String>) {
        *self.search_results.lock().unwrap() = urls;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| c.url == url).count()
    }

    fn record(&self, url: &str, credentials: &AccountCredentials) {
        self.calls.lock().unwrap().push(Call {
            url: url.to_string(),
            account_id: credentials.account_id.clone(),
        });
    }

    fn failure(&self, url: &str, account_id: &str) -> Option<ScrapeFailure> {
        if let Some(f) = self.account_failures.lock().unwrap().get(account_id) {
            return Some(f.clone());
        }
        if let Some(f) = self.url_failures.lock().unwrap().get(url) {
            return Some(f.clone());
        }
        self.queued
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl Scraper for ScriptedScraper {
    async fn scrape(
        &self,
        url: &str,
        credentials: &AccountCredentials,
        kind: ScrapeKind,
    ) -> Result<ScrapeSuccess, ScrapeFailure> {
        self.record(url, credentials);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let panics = self.panic_url.lock().unwrap().as_deref() == Some(url);
        if panics {
            panic!("scraper crashed on {}", url);
        }
        match self.failure(url, &credentials.account_id) {
            Some(failure) => Err(failure),
            None => Ok(success_for(url, kind)),
        }
    }

    async fn search(
        &self,
        query: &str,
        _max_results: u32,
        credentials: &AccountCredentials,
    ) -> Result<Vec<String>, ScrapeFailure> {
        self.record(&format!("search:{}", query), credentials);
        if let Some(f) = self.account_failures.lock().unwrap().get(&credentials.account_id) {
            return Err(f.clone());
        }
        Ok(self.search_results.lock().unwrap().clone())
    }
}

/// Scraper that holds every call until the test lets it through.
pub struct GateScraper {
    permits: Semaphore,
    entered: AtomicUsize,
    entered_notify: Notify,
    calls: Mutex<Vec<Call>>,
}

impl GateScraper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            entered_notify: Notify::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Lets `n` waiting (or future) calls complete.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Resolves once at least `n` calls have started.
    pub async fn wait_entered(&self, n: usize) {
        loop {
            let notified = self.entered_notify.notified();
            if self.entered() >= n {
                return;
            }
            notified.await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scraper for GateScraper {
    async fn scrape(
        &self,
        url: &str,
        credentials: &AccountCredentials,
        kind: ScrapeKind,
    ) -> Result<ScrapeSuccess, ScrapeFailure> {
        self.calls.lock().unwrap().push(Call {
            url: url.to_string(),
            account_id: credentials.account_id.clone(),
        });
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.entered_notify.notify_waiters();
        match self.permits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(ScrapeFailure::new("gate closed")),
        }
        Ok(success_for(url, kind))
    }

    async fn search(
        &self,
        _query: &str,
        _max_results: u32,
        _credentials: &AccountCredentials,
    ) -> Result<Vec<String>, ScrapeFailure> {
        Ok(Vec::new())
    }
}

/// Isolated environment for dispatcher and scheduler tests.
pub struct TestHarness {
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub health: Arc<AccountHealthStore>,
    pub rotator: Arc<AccountRotator>,
    pub credentials: Arc<DbCredentialStore>,
    pub jobs: JobService,
    pub progress: JobProgressBroadcaster,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
}

impl TestHarness {
    /// Must be called inside a (paused) tokio runtime.
    pub fn new() -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let clock: Arc<dyn Clock> = Arc::new(InstantClock::new());
        let health = Arc::new(AccountHealthStore::new(
            db.clone(),
            HealthPolicy::from_config(&AccountsConfig::default()),
            Arc::clone(&clock),
        ));
        let key = CookieCipher::generate_key().expect("cookie key");
        let cipher = CookieCipher::from_hex_key(&key).expect("cookie cipher");
        Self {
            rotator: Arc::new(AccountRotator::new(Arc::clone(&health))),
            credentials: Arc::new(DbCredentialStore::new(db.clone(), Arc::new(cipher))),
            jobs: JobService::new(db.clone(), Arc::clone(&clock)),
            progress: JobProgressBroadcaster::new(256),
            retry: RetryConfig {
                jitter_ratio: 0.0,
                ..RetryConfig::default()
            },
            dispatch: DispatchConfig::default(),
            db,
            clock,
            health,
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Stores an account with freshly sealed cookies.
    pub fn add(&self, mut account: Account) -> Account {
        account.encrypted_cookies = self
            .credentials
            .seal(r#"[{"name":"li_at","value":"test-session"}]"#)
            .expect("seal cookies");
        account_repo::insert(&self.db, &account).expect("insert account");
        account
    }

    pub fn create(&self, job: NewJob) -> Job {
        self.jobs.create(job).expect("create job")
    }

    pub fn job(&self, id: &str) -> Job {
        self.jobs.find(id).expect("load job").expect("job exists")
    }

    pub fn urls(&self, job_id: &str) -> Vec<JobUrl> {
        job_url_repo::list_by_job(&self.db, job_id).expect("list urls")
    }

    pub fn account(&self, id: &str) -> Account {
        self.health.find(id).expect("load account").expect("account exists")
    }

    pub fn dispatcher(&self, scraper: Arc<dyn Scraper>) -> Arc<UrlDispatcher> {
        Arc::new(UrlDispatcher::new(
            self.db.clone(),
            Arc::clone(&self.rotator),
            self.credentials.clone(),
            scraper,
            self.progress.clone(),
            RetryPolicy::new(&self.retry),
            DispatchSettings::from_config(&self.dispatch),
        ))
    }

    pub fn scheduler(&self, scraper: Arc<dyn Scraper>, max_concurrent_jobs: usize) -> Scheduler {
        Scheduler::new(
            self.db.clone(),
            self.dispatcher(scraper),
            SchedulerSettings {
                max_concurrent_jobs,
                ..SchedulerSettings::default()
            },
            Arc::clone(&self.clock),
        )
    }
}

/// Polls `condition` on the paused clock until it holds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
