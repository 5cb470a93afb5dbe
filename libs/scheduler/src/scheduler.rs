//! In-memory quota scheduler.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use qsched_events::{EventSink, TaskEvent, TaskEventKind};
use qsched_id::{AccountId, RequestId, WorkerId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    Account, AccountConfig, Balance, IdleWorker, LabelSet, Lapse, Match, Priority, RequestState,
    SchedulerError, TaskScheduler, TaskWaitingRequest, TrackedRequest, FREE_PRIORITY,
};

/// Worker currently holding an assigned request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WorkerSlot {
    request_id: RequestId,
    labels: LabelSet,
}

/// Account-quota scheduler.
///
/// Idle workers are not remembered between passes; a worker only exists in
/// the scheduler while a request is assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaScheduler {
    last_update: DateTime<Utc>,
    accounts: BTreeMap<AccountId, Account>,
    requests: BTreeMap<RequestId, TrackedRequest>,
    workers: BTreeMap<WorkerId, WorkerSlot>,
}

/// Ranking key for a waiting request: priority, then age, then id.
type Rank = (Priority, DateTime<Utc>, RequestId);

impl QuotaScheduler {
    /// Creates an empty scheduler whose quota clock starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_update: now,
            accounts: BTreeMap::new(),
            requests: BTreeMap::new(),
            workers: BTreeMap::new(),
        }
    }

    /// Registers an account with its quota config and starting balance.
    pub fn add_account(
        &mut self,
        id: AccountId,
        config: AccountConfig,
        initial_balance: Balance,
    ) -> Result<(), SchedulerError> {
        if self.accounts.contains_key(&id) {
            return Err(SchedulerError::DuplicateAccount(id));
        }
        config.validate(&id)?;
        if initial_balance.iter().any(|b| !b.is_finite()) {
            return Err(SchedulerError::InvalidConfig {
                account: id,
                reason: "initial balance must be finite".to_string(),
            });
        }

        debug!(account_id = %id, ?initial_balance, "Account registered");
        self.accounts.insert(id, Account::new(config, initial_balance));
        Ok(())
    }

    /// Time the quota clock last advanced to.
    pub fn now(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn account(&self, id: &AccountId) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn balance(&self, id: &AccountId) -> Option<&Balance> {
        self.accounts.get(id).map(Account::balance)
    }

    pub fn request(&self, id: &RequestId) -> Option<&TrackedRequest> {
        self.requests.get(id)
    }

    /// Current priority of a tracked request.
    ///
    /// Assigned requests keep the priority they were matched at (minus any
    /// demotions); waiting requests report what a pass would rank them at,
    /// ignoring fanout.
    pub fn priority_of(&self, id: &RequestId) -> Option<Priority> {
        let request = self.requests.get(id)?;
        if request.is_waiting() {
            Some(self.base_priority(request))
        } else {
            Some(request.priority)
        }
    }

    pub fn waiting_requests(&self) -> impl Iterator<Item = (&RequestId, &TrackedRequest)> {
        self.requests.iter().filter(|(_, r)| r.is_waiting())
    }

    pub fn assigned_requests(&self) -> impl Iterator<Item = (&RequestId, &TrackedRequest)> {
        self.requests.iter().filter(|(_, r)| !r.is_waiting())
    }

    /// The request placed on a worker, if any.
    pub fn assigned_to(&self, worker_id: &WorkerId) -> Option<&RequestId> {
        self.workers.get(worker_id).map(|slot| &slot.request_id)
    }

    /// Advances the quota clock. Times at or before the current one are ignored.
    ///
    /// Balances are replenished first, then every assigned paid request is
    /// charged one worker-second per elapsed second at its priority level.
    pub fn update_time(&mut self, now: DateTime<Utc>) {
        if now <= self.last_update {
            return;
        }
        let elapsed_secs = (now - self.last_update).num_milliseconds() as f64 / 1000.0;

        for account in self.accounts.values_mut() {
            account.replenish(elapsed_secs);
        }

        for request in self.requests.values() {
            if request.is_waiting() || request.priority >= FREE_PRIORITY {
                continue;
            }
            if let Some(account) = request
                .account_id
                .as_ref()
                .and_then(|id| self.accounts.get_mut(id))
            {
                account.charge(request.priority, elapsed_secs);
            }
        }

        self.last_update = now;
    }

    fn base_priority(&self, request: &TrackedRequest) -> Priority {
        request
            .account_id
            .as_ref()
            .and_then(|id| self.accounts.get(id))
            .map(Account::best_priority)
            .unwrap_or(FREE_PRIORITY)
    }

    fn free_tasks_allowed(&self, account_id: Option<&AccountId>) -> bool {
        account_id
            .and_then(|id| self.accounts.get(id))
            .map(|a| !a.config().disable_free_tasks)
            .unwrap_or(true)
    }

    /// Demotes assigned requests whose level has run out of budget.
    fn reprioritize(&mut self, events: &mut dyn EventSink) {
        let now = self.last_update;
        for (request_id, request) in self.requests.iter_mut() {
            if request.is_waiting() || request.priority >= FREE_PRIORITY {
                continue;
            }
            let demoted = match request.account_id.as_ref().and_then(|id| self.accounts.get(id)) {
                Some(account) if account.is_funded(request.priority) => continue,
                Some(account) => account.first_funded_level(request.priority),
                None => FREE_PRIORITY,
            };

            debug!(
                request_id = %request_id,
                from = request.priority,
                to = demoted,
                "Demoting request with exhausted budget"
            );
            request.priority = demoted;

            let mut event = TaskEvent::new(TaskEventKind::Reprioritized, request_id.clone(), now)
                .priority(demoted);
            if let Some(account_id) = &request.account_id {
                event = event.account(account_id.clone());
            }
            if let Some(worker_id) = request.worker_id() {
                event = event.worker(worker_id.clone());
            }
            events.add_event(event);
        }
    }

    /// Ranks waiting requests for this pass.
    ///
    /// Requests of an account beyond its fanout (counting what the account
    /// already has on workers, then walking in rank order) drop to free
    /// priority. Free requests of accounts that disable them are left out.
    fn rank_waiting(&self) -> Vec<Rank> {
        let mut on_workers: BTreeMap<&AccountId, u32> = BTreeMap::new();
        for request in self.requests.values() {
            if request.is_waiting() || request.priority >= FREE_PRIORITY {
                continue;
            }
            if let Some(account_id) = request.account_id.as_ref() {
                *on_workers.entry(account_id).or_insert(0) += 1;
            }
        }

        let mut ranked: Vec<(Rank, Option<&AccountId>)> = self
            .waiting_requests()
            .map(|(id, r)| {
                (
                    (self.base_priority(r), r.enqueue_time, id.clone()),
                    r.account_id.as_ref(),
                )
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0));

        for ((priority, _, _), account_id) in ranked.iter_mut() {
            let Some(account_id) = *account_id else {
                continue;
            };
            let Some(account) = self.accounts.get(account_id) else {
                continue;
            };
            let fanout = account.config().max_fanout;
            if fanout == 0 || *priority >= FREE_PRIORITY {
                continue;
            }
            let count = on_workers.entry(account_id).or_insert(0);
            if *count >= fanout {
                *priority = FREE_PRIORITY;
            } else {
                *count += 1;
            }
        }

        let mut ranked: Vec<Rank> = ranked
            .into_iter()
            .filter(|((priority, _, _), account_id)| {
                *priority < FREE_PRIORITY || self.free_tasks_allowed(*account_id)
            })
            .map(|(rank, _)| rank)
            .collect();
        ranked.sort();
        ranked
    }

    /// Places a request on a worker and records the offer.
    fn assign(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        worker: IdleWorker,
        priority: Priority,
        provision_required: bool,
        now: DateTime<Utc>,
    ) {
        let Some(request) = self.requests.get_mut(request_id) else {
            return;
        };
        let IdleWorker {
            id: worker_id,
            labels: worker_labels,
        } = worker;
        request.priority = priority;
        if request.offered_at.is_none() {
            request.offered_at = Some(now);
        }
        request.state = RequestState::Assigned {
            worker_id: worker_id.clone(),
            since: now,
            confirmed: false,
        };

        let mut event = TaskEvent::new(TaskEventKind::Assigned, request_id.clone(), now)
            .worker(worker_id.clone())
            .priority(priority)
            .provision_required(provision_required);
        if let Some(account_id) = &request.account_id {
            event = event.account(account_id.clone());
        }
        events.add_event(event);

        self.workers.insert(
            worker_id,
            WorkerSlot {
                request_id: request_id.clone(),
                labels: worker_labels,
            },
        );
    }

    fn runs_confirmed(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .and_then(|slot| self.requests.get(&slot.request_id))
            .is_some_and(TrackedRequest::is_confirmed)
    }

    /// Frees a worker that is no longer running what it was assigned.
    ///
    /// An unconfirmed offer goes back to the queue. A confirmed run is
    /// dropped: the caller learns of it through `is_assigned` turning false.
    fn release_worker(
        &mut self,
        events: &mut dyn EventSink,
        worker_id: &WorkerId,
        keep: Option<&RequestId>,
        now: DateTime<Utc>,
    ) {
        if self
            .workers
            .get(worker_id)
            .is_none_or(|slot| Some(&slot.request_id) == keep)
        {
            return;
        }
        let Some(slot) = self.workers.remove(worker_id) else {
            return;
        };

        let confirmed = self
            .requests
            .get(&slot.request_id)
            .is_some_and(TrackedRequest::is_confirmed);
        if confirmed {
            debug!(
                request_id = %slot.request_id,
                worker_id = %worker_id,
                "Dropping run displaced from its worker"
            );
            self.requests.remove(&slot.request_id);
            events.add_event(
                TaskEvent::new(TaskEventKind::Completed, slot.request_id, now)
                    .worker(worker_id.clone())
                    .detail("displaced from worker"),
            );
        } else if let Some(request) = self.requests.get_mut(&slot.request_id) {
            debug!(
                request_id = %slot.request_id,
                worker_id = %worker_id,
                "Returning unclaimed offer to queue"
            );
            request.state = RequestState::Waiting;
        }
    }

    /// Picks an idle worker for a request.
    ///
    /// Among label-matching workers the one with the fewest labels wins so
    /// richer workers stay free for pickier requests. Non-matching workers
    /// are only used once the label grace has passed. A worker that just let
    /// an offer of this request lapse is skipped.
    fn pick_idle_worker(
        available: &[IdleWorker],
        request: &TrackedRequest,
        now: DateTime<Utc>,
        label_grace: Duration,
    ) -> Option<(usize, bool)> {
        let eligible = |w: &IdleWorker| !request.sits_out(&w.id, now, label_grace);

        let best_fit = available
            .iter()
            .enumerate()
            .filter(|(_, w)| eligible(*w) && request.labels.is_subset_of(&w.labels))
            .min_by_key(|(index, w)| (w.labels.len(), *index))
            .map(|(index, _)| index);

        if let Some(index) = best_fit {
            return Some((index, false));
        }
        if request.provision_wait_over(now, label_grace) {
            return available.iter().position(eligible).map(|index| (index, true));
        }
        None
    }

    /// Evicts a worse confirmed run to make room for `request_id`.
    fn preempt_for(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        priority: Priority,
        now: DateTime<Utc>,
        label_grace: Duration,
    ) -> Option<Match> {
        let request = self.requests.get(request_id)?;
        if let Some(vacated) = &request.vacated {
            debug!(
                request_id = %request_id,
                worker_id = %vacated,
                "Request already evicted a run; waiting for an idle worker"
            );
            return None;
        }
        let anywhere = request.provision_wait_over(now, label_grace);

        let (label_match, _, _, worker_id, victim_id) = self
            .workers
            .iter()
            .filter_map(|(worker_id, slot)| {
                let running = self.requests.get(&slot.request_id)?;
                if !running.is_confirmed() || running.priority <= priority {
                    return None;
                }
                let label_match = request.labels.is_subset_of(&slot.labels);
                if !label_match && !anywhere {
                    return None;
                }
                Some((
                    label_match,
                    running.priority,
                    running.assigned_since()?,
                    worker_id.clone(),
                    slot.request_id.clone(),
                ))
            })
            .max_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
                    .then(b.4.cmp(&a.4))
            })?;

        let slot = self.workers.remove(&worker_id)?;
        let victim = self.requests.remove(&victim_id)?;

        debug!(
            request_id = %request_id,
            preempted_request_id = %victim_id,
            worker_id = %worker_id,
            priority,
            victim_priority = victim.priority,
            "Preempting running request"
        );

        let mut event = TaskEvent::new(TaskEventKind::Preempted, victim_id.clone(), now)
            .worker(worker_id.clone())
            .priority(victim.priority)
            .related(request_id.clone());
        if let Some(account_id) = victim.account_id {
            event = event.account(account_id);
        }
        events.add_event(event);

        if let Some(request) = self.requests.get_mut(request_id) {
            request.vacated = Some(worker_id.clone());
        }

        let provision_required = !label_match;
        self.assign(
            events,
            request_id,
            IdleWorker::new(worker_id.clone(), slot.labels),
            priority,
            provision_required,
            now,
        );

        Some(Match {
            request_id: request_id.clone(),
            worker_id,
            provision_required,
            priority,
            preempted: Some(victim_id),
        })
    }
}

impl TaskScheduler for QuotaScheduler {
    fn add_request(&mut self, events: &mut dyn EventSink, request: TaskWaitingRequest) {
        self.update_time(request.time);

        let existing = self.requests.get(&request.request_id);
        let (registered_at, offered_at, vacated, lapsed) = match existing {
            Some(existing) if !existing.is_waiting() => {
                debug!(
                    request_id = %request.request_id,
                    worker_id = ?existing.worker_id(),
                    "Ignoring waiting notification for assigned request"
                );
                return;
            }
            Some(existing) => (
                existing.registered_at,
                existing.offered_at,
                existing.vacated.clone(),
                existing.lapsed.clone(),
            ),
            None => (request.time, None, None, None),
        };

        let tracked = TrackedRequest {
            account_id: Some(request.account_id.clone()),
            labels: request.labels,
            enqueue_time: request.enqueue_time,
            registered_at,
            offered_at,
            priority: FREE_PRIORITY,
            state: RequestState::Waiting,
            vacated,
            lapsed,
        };
        let priority = self.base_priority(&tracked);

        debug!(
            request_id = %request.request_id,
            account_id = %request.account_id,
            labels = %tracked.labels,
            priority,
            "Request waiting"
        );
        events.add_event(
            TaskEvent::new(TaskEventKind::Enqueued, request.request_id.clone(), request.time)
                .account(request.account_id)
                .priority(priority),
        );
        self.requests.insert(request.request_id, tracked);
    }

    #[instrument(skip(self, events, idle_workers), fields(idle = idle_workers.len()))]
    fn match_workers(
        &mut self,
        events: &mut dyn EventSink,
        now: DateTime<Utc>,
        idle_workers: &[IdleWorker],
        label_grace: Duration,
    ) -> Vec<Match> {
        self.update_time(now);
        self.reprioritize(events);

        let mut available: Vec<IdleWorker> = Vec::with_capacity(idle_workers.len());
        for worker in idle_workers {
            if available.iter().any(|w| w.id == worker.id) {
                continue;
            }
            if self.runs_confirmed(&worker.id) {
                debug!(worker_id = %worker.id, "Ignoring idle report from busy worker");
                continue;
            }
            self.release_worker(events, &worker.id, None, now);
            available.push(worker.clone());
        }

        let mut matches = Vec::new();
        let mut unmatched = Vec::new();

        for (priority, _, request_id) in self.rank_waiting() {
            let Some(request) = self.requests.get(&request_id) else {
                continue;
            };
            let Some((index, provision_required)) =
                Self::pick_idle_worker(&available, request, now, label_grace)
            else {
                unmatched.push((request_id, priority));
                continue;
            };

            let worker = available.remove(index);
            let worker_id = worker.id.clone();
            self.assign(events, &request_id, worker, priority, provision_required, now);
            matches.push(Match {
                request_id,
                worker_id,
                provision_required,
                priority,
                preempted: None,
            });
        }

        for (request_id, priority) in unmatched {
            if priority >= FREE_PRIORITY {
                break;
            }
            if let Some(m) = self.preempt_for(events, &request_id, priority, now, label_grace) {
                matches.push(m);
            }
        }

        debug!(matched = matches.len(), "Scheduling pass complete");
        matches
    }

    fn notify_running(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        worker_id: &WorkerId,
        time: DateTime<Utc>,
    ) {
        self.update_time(time);
        let labels = self
            .workers
            .get(worker_id)
            .map(|slot| slot.labels.clone())
            .unwrap_or_default();
        self.release_worker(events, worker_id, Some(request_id), time);

        let previous_worker = self
            .requests
            .get(request_id)
            .and_then(TrackedRequest::worker_id)
            .filter(|w| *w != worker_id)
            .cloned();
        if let Some(previous) = previous_worker {
            debug!(
                request_id = %request_id,
                from = %previous,
                to = %worker_id,
                "Request moved to another worker"
            );
            self.workers.remove(&previous);
        }

        if !self.requests.contains_key(request_id) {
            debug!(request_id = %request_id, "Running notification for unknown request");
            self.requests.insert(
                request_id.clone(),
                TrackedRequest {
                    account_id: None,
                    labels: LabelSet::new(),
                    enqueue_time: time,
                    registered_at: time,
                    offered_at: None,
                    priority: FREE_PRIORITY,
                    state: RequestState::Waiting,
                    vacated: None,
                    lapsed: None,
                },
            );
        }

        let waiting_priority = self
            .requests
            .get(request_id)
            .filter(|r| r.is_waiting())
            .map(|r| self.base_priority(r));

        let Some(request) = self.requests.get_mut(request_id) else {
            return;
        };
        if let Some(priority) = waiting_priority {
            request.priority = priority;
        }
        let since = match &request.state {
            RequestState::Assigned {
                worker_id: current,
                since,
                ..
            } if current == worker_id => *since,
            _ => time,
        };
        request.state = RequestState::Assigned {
            worker_id: worker_id.clone(),
            since,
            confirmed: true,
        };

        let mut event = TaskEvent::new(TaskEventKind::Running, request_id.clone(), time)
            .worker(worker_id.clone())
            .priority(request.priority);
        if let Some(account_id) = &request.account_id {
            event = event.account(account_id.clone());
        }
        events.add_event(event);

        self.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                request_id: request_id.clone(),
                labels,
            },
        );
    }

    fn requeue(&mut self, request_id: &RequestId, offered_at: DateTime<Utc>) {
        let Some(request) = self.requests.get_mut(request_id) else {
            return;
        };
        let RequestState::Assigned {
            worker_id,
            confirmed: false,
            ..
        } = &request.state
        else {
            return;
        };

        debug!(request_id = %request_id, worker_id = %worker_id, "Requeueing unclaimed request");
        self.workers.remove(worker_id);

        // A worker emptied by preemption could not have claimed the offer
        // earlier, so it is not held against it.
        if request.vacated.as_ref() != Some(worker_id) {
            request.lapsed = Some(Lapse {
                worker_id: worker_id.clone(),
                offered_at,
            });
        }
        let first_offer = request.offered_at.map_or(offered_at, |first| first.min(offered_at));
        request.offered_at = Some(first_offer);
        request.state = RequestState::Waiting;
    }

    fn remove_request(
        &mut self,
        events: &mut dyn EventSink,
        request_id: &RequestId,
        time: DateTime<Utc>,
    ) {
        self.update_time(time);
        let Some(request) = self.requests.remove(request_id) else {
            return;
        };

        let mut event = TaskEvent::new(TaskEventKind::Completed, request_id.clone(), time);
        if let Some(worker_id) = request.worker_id() {
            if self
                .workers
                .get(worker_id)
                .is_some_and(|slot| &slot.request_id == request_id)
            {
                self.workers.remove(worker_id);
            }
            event = event.worker(worker_id.clone());
        }
        if let Some(account_id) = request.account_id {
            event = event.account(account_id);
        }
        events.add_event(event);
    }

    fn is_assigned(&self, request_id: &RequestId, worker_id: &WorkerId) -> bool {
        self.requests
            .get(request_id)
            .and_then(TrackedRequest::worker_id)
            .is_some_and(|w| w == worker_id)
    }
}
