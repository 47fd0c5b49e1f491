//! Project, quota, and membership service.
//!
//! Projects group VMs for ownership. Quotas feed the orchestrator's
//! provision/resize checks and policy resolution inputs; membership is plain
//! RBAC-style bookkeeping.

use crate::error::Result;
use crate::state::StateManager;
use crate::timeline::EventTimeline;
use crate::types::{EventSubjects, EventType, Project, ProjectMember, Quota};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub struct ProjectService {
    state: Arc<StateManager>,
    timeline: Arc<EventTimeline>,
}

impl ProjectService {
    pub fn new(state: Arc<StateManager>, timeline: Arc<EventTimeline>) -> Self {
        Self { state, timeline }
    }

    /// Create a project with an uncapped quota.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn create(&self, name: &str, description: &str) -> Result<Project> {
        let project = Project {
            project_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            quota: Quota::default(),
            created_at: Utc::now(),
        };
        self.state.insert_project(&project).await?;

        self.timeline
            .append(
                EventType::ProjectCreated,
                EventSubjects::project(&project.project_id),
                format!("project {} created", project.name),
            )
            .await?;

        Ok(project)
    }

    pub async fn get(&self, project_id: &str) -> Result<Project> {
        self.state.get_project(project_id).await
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        self.state.list_projects().await
    }

    /// Replace a project's quota. Zero on an axis leaves it uncapped.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn set_quota(&self, project_id: &str, quota: Quota) -> Result<Project> {
        let project = self.state.get_project(project_id).await?;
        self.state.update_project_quota(project_id, quota).await?;

        self.timeline
            .append(
                EventType::ProjectQuotaUpdated,
                EventSubjects::project(project_id),
                format!(
                    "quota for project {} set to {} cores / {} MB / {} VMs",
                    project.name, quota.cpu_cores, quota.memory_mb, quota.vm_limit
                ),
            )
            .await?;

        self.state.get_project(project_id).await
    }

    /// Add a member to a project. Duplicate users fail with `Conflict`.
    #[instrument(skip(self), fields(project_id = %project_id, user_id = %user_id))]
    pub async fn add_member(
        &self,
        project_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<ProjectMember> {
        let project = self.state.get_project(project_id).await?;

        let member = ProjectMember {
            member_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
        };
        self.state.insert_member(&member).await?;

        self.timeline
            .append(
                EventType::ProjectMemberAdded,
                EventSubjects::project(project_id),
                format!("member {} added to project {} as {}", user_id, project.name, role),
            )
            .await?;

        Ok(member)
    }

    pub async fn list_members(&self, project_id: &str) -> Result<Vec<ProjectMember>> {
        self.state.get_project(project_id).await?;
        self.state.list_members(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratoError;

    async fn service() -> ProjectService {
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        let timeline = Arc::new(EventTimeline::new(state.clone(), 30));
        ProjectService::new(state, timeline)
    }

    #[tokio::test]
    async fn test_create_and_quota() {
        let service = service().await;

        let project = service.create("team-a", "first team").await.unwrap();
        assert_eq!(project.quota, Quota::default());

        let updated = service
            .set_quota(&project.project_id, Quota { cpu_cores: 32, memory_mb: 131072, vm_limit: 10 })
            .await
            .unwrap();
        assert_eq!(updated.quota.cpu_cores, 32);
        assert_eq!(updated.quota.vm_limit, 10);
    }

    #[tokio::test]
    async fn test_duplicate_member_conflicts() {
        let service = service().await;
        let project = service.create("team-a", "").await.unwrap();

        service.add_member(&project.project_id, "alice", "admin").await.unwrap();
        let err = service.add_member(&project.project_id, "alice", "viewer").await.unwrap_err();
        assert!(matches!(err, StratoError::Conflict { .. }));

        let members = service.list_members(&project.project_id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, "admin");
    }

    #[tokio::test]
    async fn test_unknown_project_fails() {
        let service = service().await;
        let err = service.set_quota("ghost", Quota::default()).await.unwrap_err();
        assert!(matches!(err, StratoError::ProjectNotFound { .. }));
    }
}
