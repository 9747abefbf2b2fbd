//! In-memory host platform and mailer for testing

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tenrol_api::{RoleAssigned, RoleUnassigned};
use tenrol_util::{ContextId, CourseId, EnrolInstanceId, RoleAssignmentId, RoleId, UserId};
use tokio::sync::mpsc;

use crate::{
    CourseInfo, EnrolmentInstance, HostError, HostEvent, HostPlatform, HostResult, Mailer,
    RenderedEmail, RoleAssignment, UserProfile, MANUAL_ENROL_METHOD,
};

#[derive(Default)]
struct MockState {
    users: HashMap<UserId, UserProfile>,
    courses: HashMap<CourseId, CourseInfo>,
    contexts: HashMap<ContextId, CourseId>,
    assignments: BTreeMap<RoleAssignmentId, RoleAssignment>,
    instances: Vec<EnrolmentInstance>,
    enrolments: BTreeSet<(EnrolInstanceId, UserId)>,
    next_id: i64,
}

impl MockState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mock LMS for unit/integration testing
pub struct MockPlatform {
    state: Mutex<MockState>,
    event_tx: mpsc::UnboundedSender<HostEvent>,
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>>,

    /// Configure every call to fail
    pub fail_calls: Arc<Mutex<bool>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            state: Mutex::new(MockState::default()),
            event_tx: tx,
            event_rx: Arc::new(Mutex::new(Some(rx))),
            fail_calls: Arc::new(Mutex::new(false)),
        }
    }

    pub fn add_user(&self, id: i64, firstname: &str, lastname: &str) -> UserProfile {
        let user = UserProfile {
            id: UserId::new(id),
            firstname: firstname.into(),
            lastname: lastname.into(),
            email: format!("{}@example.org", firstname.to_lowercase()),
        };
        self.state
            .lock()
            .unwrap()
            .users
            .insert(user.id, user.clone());
        user
    }

    /// Create a course with its context and a manual enrolment instance
    pub fn add_course(&self, id: i64, fullname: &str, context: i64) -> CourseInfo {
        let course = CourseInfo {
            id: CourseId::new(id),
            fullname: fullname.into(),
        };

        let mut state = self.state.lock().unwrap();
        state.courses.insert(course.id, course.clone());
        state.contexts.insert(ContextId::new(context), course.id);
        let instance_id = EnrolInstanceId::new(state.next_id());
        state.instances.push(EnrolmentInstance {
            id: instance_id,
            course_id: course.id,
            method: MANUAL_ENROL_METHOD.into(),
        });
        course
    }

    /// Add a non-manual enrolment method to a course
    pub fn add_enrol_method(&self, course: CourseId, method: &str) -> EnrolmentInstance {
        let mut state = self.state.lock().unwrap();
        let instance = EnrolmentInstance {
            id: EnrolInstanceId::new(state.next_id()),
            course_id: course,
            method: method.into(),
        };
        state.instances.push(instance.clone());
        instance
    }

    /// Enrol a user through a course's manual instance
    pub fn enrol(&self, course: CourseId, user: UserId) {
        let mut state = self.state.lock().unwrap();
        let manual = state
            .instances
            .iter()
            .find(|i| i.course_id == course && i.is_manual())
            .map(|i| i.id);
        if let Some(instance) = manual {
            state.enrolments.insert((instance, user));
        }
    }

    /// Whether the user holds any enrolment in the course
    pub fn is_enrolled(&self, course: CourseId, user: UserId) -> bool {
        let state = self.state.lock().unwrap();
        state.instances.iter().any(|i| {
            i.course_id == course && state.enrolments.contains(&(i.id, user))
        })
    }

    /// Insert an assignment without emitting an event, as if it predated the service
    pub fn seed_assignment(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        modifier: UserId,
        time_modified: i64,
    ) -> RoleAssignment {
        let mut state = self.state.lock().unwrap();
        let assignment = RoleAssignment {
            id: RoleAssignmentId::new(state.next_id()),
            role_id: role,
            context_id: context,
            user_id: user,
            modifier_id: modifier,
            time_modified,
        };
        state.assignments.insert(assignment.id, assignment.clone());
        assignment
    }

    pub fn assignment_count(&self) -> usize {
        self.state.lock().unwrap().assignments.len()
    }

    fn check_fail(&self) -> HostResult<()> {
        if *self.fail_calls.lock().unwrap() {
            return Err(HostError::Internal("Mock host failure".into()));
        }
        Ok(())
    }

    fn emit_unassigned(&self, state: &MockState, assignment: &RoleAssignment, actor: UserId) {
        let course_id = state
            .contexts
            .get(&assignment.context_id)
            .copied()
            .unwrap_or(CourseId::new(0));
        let _ = self
            .event_tx
            .send(HostEvent::RoleUnassigned(RoleUnassigned {
                actor_id: actor,
                subject_id: assignment.user_id,
                context_id: assignment.context_id,
                course_id,
                role_id: assignment.role_id,
                role_assignment_id: assignment.id,
                timestamp: tenrol_util::unix_now(),
            }));
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPlatform for MockPlatform {
    fn assignments_for_user(
        &self,
        user: UserId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>> {
        self.check_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .assignments
            .values()
            .filter(|a| a.user_id == user && a.context_id == context)
            .cloned()
            .collect())
    }

    fn assignments_for_role(&self, role: RoleId) -> HostResult<Vec<RoleAssignment>> {
        self.check_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .assignments
            .values()
            .filter(|a| a.role_id == role)
            .cloned()
            .collect())
    }

    fn assignments_for_role_in_context(
        &self,
        role: RoleId,
        context: ContextId,
    ) -> HostResult<Vec<RoleAssignment>> {
        self.check_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .assignments
            .values()
            .filter(|a| a.role_id == role && a.context_id == context)
            .cloned()
            .collect())
    }

    fn get_assignment(&self, id: RoleAssignmentId) -> HostResult<Option<RoleAssignment>> {
        self.check_fail()?;
        Ok(self.state.lock().unwrap().assignments.get(&id).cloned())
    }

    fn assign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
        timestamp: i64,
    ) -> HostResult<RoleAssignment> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let course_id = *state
            .contexts
            .get(&context)
            .ok_or(HostError::UnknownContext(context))?;

        let assignment = RoleAssignment {
            id: RoleAssignmentId::new(state.next_id()),
            role_id: role,
            context_id: context,
            user_id: user,
            modifier_id: actor,
            time_modified: timestamp,
        };
        state.assignments.insert(assignment.id, assignment.clone());

        let _ = self.event_tx.send(HostEvent::RoleAssigned(RoleAssigned {
            actor_id: actor,
            subject_id: user,
            context_id: context,
            course_id,
            role_id: role,
            role_assignment_id: assignment.id,
            timestamp,
        }));

        Ok(assignment)
    }

    fn remove_assignment(
        &self,
        id: RoleAssignmentId,
        actor: UserId,
    ) -> HostResult<Option<RoleAssignment>> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let removed = state.assignments.remove(&id);
        if let Some(assignment) = &removed {
            self.emit_unassigned(&state, assignment, actor);
        }
        Ok(removed)
    }

    fn unassign_role(
        &self,
        role: RoleId,
        user: UserId,
        context: ContextId,
        actor: UserId,
    ) -> HostResult<Vec<RoleAssignment>> {
        self.check_fail()?;
        let mut state = self.state.lock().unwrap();
        let ids: Vec<RoleAssignmentId> = state
            .assignments
            .values()
            .filter(|a| a.role_id == role && a.user_id == user && a.context_id == context)
            .map(|a| a.id)
            .collect();

        let mut removed = Vec::new();
        for id in ids {
            if let Some(assignment) = state.assignments.remove(&id) {
                self.emit_unassigned(&state, &assignment, actor);
                removed.push(assignment);
            }
        }
        Ok(removed)
    }

    fn enrolment_instances(&self, course: CourseId) -> HostResult<Vec<EnrolmentInstance>> {
        self.check_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .iter()
            .filter(|i| i.course_id == course)
            .cloned()
            .collect())
    }

    fn course_for_context(&self, context: ContextId) -> HostResult<Option<CourseId>> {
        self.check_fail()?;
        Ok(self.state.lock().unwrap().contexts.get(&context).copied())
    }

    fn user(&self, id: UserId) -> HostResult<Option<UserProfile>> {
        self.check_fail()?;
        Ok(self.state.lock().unwrap().users.get(&id).cloned())
    }

    fn course(&self, id: CourseId) -> HostResult<Option<CourseInfo>> {
        self.check_fail()?;
        Ok(self.state.lock().unwrap().courses.get(&id).cloned())
    }

    fn unenrol(&self, instance: &EnrolmentInstance, user: UserId) -> HostResult<bool> {
        self.check_fail()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .enrolments
            .remove(&(instance.id, user)))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .expect("subscribe() can only be called once")
    }
}

/// A message captured by [`MockMailer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: UserId,
    pub address: String,
    pub email: RenderedEmail,
}

/// Mailer that records messages instead of delivering them
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<SentMail>>,

    /// Configure delivery to fail
    pub fail_send: Arc<Mutex<bool>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, user: UserId) -> Vec<SentMail> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.to == user)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Mailer for MockMailer {
    fn send(&self, to: &UserProfile, email: &RenderedEmail) -> HostResult<()> {
        if *self.fail_send.lock().unwrap() {
            return Err(HostError::Mail("Mock mail failure".into()));
        }

        self.sent.lock().unwrap().push(SentMail {
            to: to.id,
            address: to.email.clone(),
            email: email.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MockPlatform, CourseInfo, UserProfile) {
        let host = MockPlatform::new();
        let course = host.add_course(2, "Algebra", 20);
        let user = host.add_user(5, "Sam", "Student");
        (host, course, user)
    }

    #[test]
    fn assign_emits_event() {
        let (host, course, user) = setup();
        let mut rx = host.subscribe();

        let ra = host
            .assign_role(RoleId::new(9), user.id, ContextId::new(20), UserId::new(3), 1_000)
            .unwrap();

        match rx.try_recv().unwrap() {
            HostEvent::RoleAssigned(ev) => {
                assert_eq!(ev.role_assignment_id, ra.id);
                assert_eq!(ev.course_id, course.id);
                assert_eq!(ev.actor_id, UserId::new(3));
                assert_eq!(ev.timestamp, 1_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn assign_in_unknown_context_fails() {
        let (host, _course, user) = setup();
        let result = host.assign_role(RoleId::new(9), user.id, ContextId::new(99), user.id, 0);
        assert!(matches!(result, Err(HostError::UnknownContext(_))));
    }

    #[test]
    fn unassign_role_removes_and_emits() {
        let (host, _course, user) = setup();
        let mut rx = host.subscribe();
        let ctx = ContextId::new(20);

        host.assign_role(RoleId::new(9), user.id, ctx, user.id, 0)
            .unwrap();
        host.assign_role(RoleId::new(5), user.id, ctx, user.id, 0)
            .unwrap();
        let _ = rx.try_recv();
        let _ = rx.try_recv();

        let removed = host
            .unassign_role(RoleId::new(9), user.id, ctx, UserId::new(1))
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(host.assignments_for_user(user.id, ctx).unwrap().len(), 1);
        assert!(matches!(rx.try_recv(), Ok(HostEvent::RoleUnassigned(ev)) if ev.role_id == RoleId::new(9)));
    }

    #[test]
    fn remove_missing_assignment() {
        let (host, _course, _user) = setup();
        let _rx = host.subscribe();
        let removed = host
            .remove_assignment(RoleAssignmentId::new(404), UserId::new(1))
            .unwrap();
        assert!(removed.is_none());
    }

    #[test]
    fn unenrol_is_idempotent() {
        let (host, course, user) = setup();
        host.enrol(course.id, user.id);
        assert!(host.is_enrolled(course.id, user.id));

        let manual = host
            .enrolment_instances(course.id)
            .unwrap()
            .into_iter()
            .find(|i| i.is_manual())
            .unwrap();
        assert!(host.unenrol(&manual, user.id).unwrap());
        assert!(!host.unenrol(&manual, user.id).unwrap());
        assert!(!host.is_enrolled(course.id, user.id));
    }

    #[test]
    fn mailer_records_and_fails() {
        let (_host, _course, user) = setup();
        let mailer = MockMailer::new();
        let email = RenderedEmail {
            subject: "Hi".into(),
            body: "Body".into(),
        };

        mailer.send(&user, &email).unwrap();
        assert_eq!(mailer.sent_to(user.id).len(), 1);
        assert_eq!(mailer.sent()[0].address, "sam@example.org");

        *mailer.fail_send.lock().unwrap() = true;
        assert!(matches!(mailer.send(&user, &email), Err(HostError::Mail(_))));
        assert_eq!(mailer.sent().len(), 1);
    }
}
