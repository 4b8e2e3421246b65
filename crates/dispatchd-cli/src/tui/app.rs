//! TUI application state and data model.

use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use dispatchd_core::handlers::build_resume_prompt;
use dispatchd_db::models::{Checkpoint, Schedule, ScheduleExecution, ScheduleStatus, Task, TaskStatus};
use dispatchd_db::queries::{checkpoints, schedules as schedule_db, tasks as task_db};

/// Which view the TUI is currently showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    TaskList,
    TaskDetail(Uuid),
    ScheduleList,
    ScheduleDetail(Uuid),
    Help,
}

/// Application state for the TUI.
pub struct App {
    pub pool: SqlitePool,
    pub current_view: View,
    pub tasks: Vec<Task>,
    pub selected_task: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub schedules: Vec<Schedule>,
    pub selected_schedule: usize,
    pub executions: Vec<ScheduleExecution>,
    pub tick_rate: Duration,
    pub should_quit: bool,
    pub status_message: Option<String>,
}

impl App {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            current_view: View::TaskList,
            tasks: Vec::new(),
            selected_task: 0,
            checkpoints: Vec::new(),
            schedules: Vec::new(),
            selected_schedule: 0,
            executions: Vec::new(),
            tick_rate: Duration::from_secs(1),
            should_quit: false,
            status_message: None,
        }
    }

    /// Refresh data from the database based on the current view.
    pub async fn refresh(&mut self) -> Result<()> {
        match &self.current_view {
            View::TaskList => self.refresh_tasks().await?,
            View::TaskDetail(task_id) => {
                let task_id = *task_id;
                self.refresh_tasks().await?;
                self.checkpoints = checkpoints::list_checkpoints_for_task(&self.pool, task_id).await?;
            }
            View::ScheduleList => self.refresh_schedules().await?,
            View::ScheduleDetail(schedule_id) => {
                let schedule_id = *schedule_id;
                self.refresh_schedules().await?;
                self.executions = schedule_db::list_executions(&self.pool, schedule_id).await?;
            }
            View::Help => {}
        }
        Ok(())
    }

    async fn refresh_tasks(&mut self) -> Result<()> {
        self.tasks = task_db::list_tasks(&self.pool, 200).await?;
        if self.selected_task >= self.tasks.len() && !self.tasks.is_empty() {
            self.selected_task = self.tasks.len() - 1;
        }
        Ok(())
    }

    async fn refresh_schedules(&mut self) -> Result<()> {
        self.schedules = schedule_db::list_schedules(&self.pool).await?;
        if self.selected_schedule >= self.schedules.len() && !self.schedules.is_empty() {
            self.selected_schedule = self.schedules.len() - 1;
        }
        Ok(())
    }

    // -- Navigation --

    pub fn navigate_back(&mut self) {
        match &self.current_view {
            View::TaskList => self.should_quit = true,
            View::TaskDetail(_) => self.current_view = View::TaskList,
            View::ScheduleList => self.current_view = View::TaskList,
            View::ScheduleDetail(_) => self.current_view = View::ScheduleList,
            View::Help => self.current_view = View::TaskList,
        }
    }

    pub fn navigate_enter(&mut self) {
        match &self.current_view {
            View::TaskList => {
                if let Some(task) = self.tasks.get(self.selected_task) {
                    self.current_view = View::TaskDetail(task.id);
                }
            }
            View::ScheduleList => {
                if let Some(schedule) = self.schedules.get(self.selected_schedule) {
                    self.current_view = View::ScheduleDetail(schedule.id);
                }
            }
            _ => {}
        }
    }

    pub fn move_up(&mut self) {
        match &self.current_view {
            View::TaskList | View::TaskDetail(_) => {
                if self.selected_task > 0 {
                    self.selected_task -= 1;
                }
            }
            View::ScheduleList | View::ScheduleDetail(_) => {
                if self.selected_schedule > 0 {
                    self.selected_schedule -= 1;
                }
            }
            _ => {}
        }
    }

    pub fn move_down(&mut self) {
        match &self.current_view {
            View::TaskList | View::TaskDetail(_) => {
                if !self.tasks.is_empty() && self.selected_task < self.tasks.len() - 1 {
                    self.selected_task += 1;
                }
            }
            View::ScheduleList | View::ScheduleDetail(_) => {
                if !self.schedules.is_empty() && self.selected_schedule < self.schedules.len() - 1 {
                    self.selected_schedule += 1;
                }
            }
            _ => {}
        }
    }

    pub fn cycle_view(&mut self) {
        self.current_view = match &self.current_view {
            View::TaskList => View::ScheduleList,
            View::ScheduleList => View::TaskList,
            other => other.clone(),
        };
    }

    pub fn show_help(&mut self) {
        self.current_view = View::Help;
    }

    // -- Task actions --

    pub async fn cancel_selected(&mut self) -> Result<()> {
        let Some(task) = self.selected_task_row() else { return Ok(()) };
        if task.status != TaskStatus::Queued {
            self.status_message = Some(format!("task is {}, only queued tasks can be cancelled", task.status));
            return Ok(());
        }

        let affected =
            task_db::transition_task_status(&self.pool, task.id, TaskStatus::Queued, TaskStatus::Cancelled).await?;
        self.status_message = Some(if affected > 0 {
            "task cancelled".to_string()
        } else {
            "task changed status before it could be cancelled".to_string()
        });
        self.refresh().await
    }

    pub async fn retry_selected(&mut self) -> Result<()> {
        let Some(task) = self.selected_task_row() else { return Ok(()) };
        if !task.status.is_terminal() {
            self.status_message = Some(format!("task is {}, only terminal tasks can be retried", task.status));
            return Ok(());
        }

        let retry = task_db::insert_retry(&self.pool, task, Uuid::new_v4()).await?;
        self.status_message = Some(format!("retried as {}", retry.display_id()));
        self.refresh().await
    }

    pub async fn resume_selected(&mut self) -> Result<()> {
        let Some(task) = self.selected_task_row().cloned() else { return Ok(()) };
        if !task.status.is_terminal() {
            self.status_message = Some(format!("task is {}, only terminal tasks can be resumed", task.status));
            return Ok(());
        }

        let checkpoint = checkpoints::latest_checkpoint(&self.pool, task.id).await?;
        let prompt = build_resume_prompt(&task, checkpoint.as_ref(), None);

        let mut resume_source = task.clone();
        resume_source.prompt = prompt;
        let resumed = task_db::insert_retry(&self.pool, &resume_source, Uuid::new_v4()).await?;

        self.status_message = Some(format!("resumed as {}", resumed.display_id()));
        self.refresh().await
    }

    fn selected_task_row(&self) -> Option<&Task> {
        match &self.current_view {
            View::TaskList | View::TaskDetail(_) => self.tasks.get(self.selected_task),
            _ => None,
        }
    }

    // -- Schedule actions --

    pub async fn pause_selected_schedule(&mut self) -> Result<()> {
        self.set_selected_schedule_status(ScheduleStatus::Paused).await
    }

    pub async fn resume_selected_schedule(&mut self) -> Result<()> {
        self.set_selected_schedule_status(ScheduleStatus::Active).await
    }

    pub async fn cancel_selected_schedule(&mut self) -> Result<()> {
        self.set_selected_schedule_status(ScheduleStatus::Cancelled).await
    }

    async fn set_selected_schedule_status(&mut self, to: ScheduleStatus) -> Result<()> {
        let Some(schedule) = self.selected_schedule_row() else { return Ok(()) };
        let terminal = matches!(
            schedule.status,
            ScheduleStatus::Completed | ScheduleStatus::Cancelled | ScheduleStatus::Expired | ScheduleStatus::Failed
        );
        if terminal {
            self.status_message = Some(format!("schedule is already {}", schedule.status));
            return Ok(());
        }

        let schedule_id = schedule.id;
        schedule_db::set_status(&self.pool, schedule_id, to).await?;
        self.status_message = Some(format!("schedule set to {to}"));
        self.refresh().await
    }

    fn selected_schedule_row(&self) -> Option<&Schedule> {
        match &self.current_view {
            View::ScheduleList | View::ScheduleDetail(_) => self.schedules.get(self.selected_schedule),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_navigation() {
        let task_id = Uuid::new_v4();

        let view = View::TaskDetail(task_id);
        assert_ne!(view, View::TaskList);

        let view = View::Help;
        assert_ne!(view, View::TaskList);

        let view = View::ScheduleList;
        assert_ne!(view, View::TaskList);
    }
}
