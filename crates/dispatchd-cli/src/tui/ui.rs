//! TUI rendering using ratatui.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Frame;

use dispatchd_db::models::{ScheduleStatus, TaskStatus};

use super::app::{App, View};

/// Render the current view.
pub fn render(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),    // main content
            Constraint::Length(1), // status bar
        ])
        .split(f.area());

    match &app.current_view {
        View::TaskList => render_task_list(f, app, chunks[0]),
        View::TaskDetail(task_id) => render_task_detail(f, app, *task_id, chunks[0]),
        View::ScheduleList => render_schedule_list(f, app, chunks[0]),
        View::ScheduleDetail(schedule_id) => render_schedule_detail(f, app, *schedule_id, chunks[0]),
        View::Help => render_help(f, chunks[0]),
    }

    render_status_bar(f, app, chunks[1]);
}

fn render_task_list(f: &mut Frame, app: &App, area: Rect) {
    let header_cells = ["ID", "Status", "Priority", "Retry", "Worktree", "Prompt"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let header = Row::new(header_cells).height(1);

    let rows = app.tasks.iter().enumerate().map(|(i, task)| {
        let style = if i == app.selected_task {
            Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        Row::new(vec![
            Cell::from(task.id.to_string().chars().take(8).collect::<String>()),
            Cell::from(task_status_colored(&task.status)),
            Cell::from(task.priority.to_string()),
            Cell::from(task.retry_count.to_string()),
            Cell::from(if task.use_worktree { "yes" } else { "no" }),
            Cell::from(truncate(&task.prompt, 48)),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(9),
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Min(20),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(" Tasks "));

    f.render_widget(table, area);
}

fn render_task_detail(f: &mut Frame, app: &App, task_id: uuid::Uuid, area: Rect) {
    let task = app.tasks.iter().find(|t| t.id == task_id);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Min(5)])
        .split(area);

    let info_text = if let Some(t) = task {
        vec![
            Line::from(vec![
                Span::styled("Task: ", Style::default().fg(Color::Yellow)),
                Span::raw(t.display_id()),
            ]),
            Line::from(vec![
                Span::styled("Status: ", Style::default().fg(Color::Yellow)),
                task_status_colored(&t.status),
                Span::raw(format!("  Priority: {}  Retries: {}", t.priority, t.retry_count)),
            ]),
            Line::from(vec![
                Span::styled("Prompt: ", Style::default().fg(Color::Yellow)),
                Span::raw(truncate(&t.prompt, 90)),
            ]),
            Line::from(format!(
                "Parent: {}  Retry of: {}  Continue from: {}",
                t.parent_task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                t.retry_of.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                t.continue_from.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
            )),
        ]
    } else {
        vec![Line::from("Task not found")]
    };

    let info = Paragraph::new(info_text).block(Block::default().borders(Borders::ALL).title(" Task Detail "));
    f.render_widget(info, chunks[0]);

    let checkpoint_header_cells = ["Time", "Kind", "Branch", "Commit", "Note"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let checkpoint_header = Row::new(checkpoint_header_cells).height(1);

    let checkpoint_rows = app.checkpoints.iter().rev().map(|c| {
        Row::new(vec![
            Cell::from(c.created_at.format("%H:%M:%S").to_string()),
            Cell::from(c.kind.to_string()),
            Cell::from(c.git_branch.clone().unwrap_or_else(|| "-".to_string())),
            Cell::from(
                c.commit_sha
                    .as_deref()
                    .map(|sha| sha.chars().take(8).collect::<String>())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::from(c.note.clone().unwrap_or_else(|| "-".to_string())),
        ])
    });

    let checkpoint_table = Table::new(
        checkpoint_rows,
        [
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Percentage(20),
            Constraint::Length(10),
            Constraint::Min(20),
        ],
    )
    .header(checkpoint_header)
    .block(Block::default().borders(Borders::ALL).title(" Checkpoints "));
    f.render_widget(checkpoint_table, chunks[1]);
}

fn render_schedule_list(f: &mut Frame, app: &App, area: Rect) {
    let header_cells = ["ID", "Kind", "Status", "Runs", "Next Run", "Cron/At"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let header = Row::new(header_cells).height(1);

    let rows = app.schedules.iter().enumerate().map(|(i, s)| {
        let style = if i == app.selected_schedule {
            Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let next = s
            .next_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        Row::new(vec![
            Cell::from(s.id.to_string().chars().take(8).collect::<String>()),
            Cell::from(s.kind.to_string()),
            Cell::from(schedule_status_colored(&s.status)),
            Cell::from(s.run_count.to_string()),
            Cell::from(next),
            Cell::from(s.cron_expr.clone().unwrap_or_else(|| "-".to_string())),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(6),
            Constraint::Length(18),
            Constraint::Min(16),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(" Schedules "));

    f.render_widget(table, area);
}

fn render_schedule_detail(f: &mut Frame, app: &App, schedule_id: uuid::Uuid, area: Rect) {
    let schedule = app.schedules.iter().find(|s| s.id == schedule_id);

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(6), Constraint::Min(5)])
        .split(area);

    let info_text = if let Some(s) = schedule {
        vec![
            Line::from(vec![
                Span::styled("Schedule: ", Style::default().fg(Color::Yellow)),
                Span::raw(s.id.to_string()),
            ]),
            Line::from(vec![
                Span::styled("Status: ", Style::default().fg(Color::Yellow)),
                schedule_status_colored(&s.status),
                Span::raw(format!("  Kind: {}  Runs: {}", s.kind, s.run_count)),
            ]),
            Line::from(format!(
                "Cron: {}  Timezone: {}",
                s.cron_expr.as_deref().unwrap_or("-"),
                s.timezone,
            )),
            Line::from(format!("Task template: {}", truncate(&s.task_template.to_string(), 90))),
        ]
    } else {
        vec![Line::from("Schedule not found")]
    };

    let info = Paragraph::new(info_text).block(Block::default().borders(Borders::ALL).title(" Schedule Detail "));
    f.render_widget(info, chunks[0]);

    let exec_header_cells = ["Fired At", "Task", "Missed"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let exec_header = Row::new(exec_header_cells).height(1);

    let exec_rows = app.executions.iter().rev().map(|e| {
        Row::new(vec![
            Cell::from(e.fired_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::from(e.task_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::from(if e.was_missed_run { "yes" } else { "no" }),
        ])
    });

    let exec_table = Table::new(
        exec_rows,
        [Constraint::Length(20), Constraint::Length(38), Constraint::Length(8)],
    )
    .header(exec_header)
    .block(Block::default().borders(Borders::ALL).title(" Executions "));
    f.render_widget(exec_table, chunks[1]);
}

fn render_help(f: &mut Frame, area: Rect) {
    let text = vec![
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Navigation",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    j/Down    Move down"),
        Line::from("    k/Up      Move up"),
        Line::from("    Enter     Drill into selected"),
        Line::from("    Esc/q     Back / Quit"),
        Line::from("    Tab       Toggle Tasks / Schedules"),
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Task actions",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    c         Cancel selected task (if queued)"),
        Line::from("    R         Retry selected task (if terminal)"),
        Line::from("    u         Resume selected task with its last checkpoint"),
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Schedule actions",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    p         Pause selected schedule"),
        Line::from("    r         Resume selected schedule"),
        Line::from("    c         Cancel selected schedule"),
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Other",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    ?         Show this help"),
        Line::from(""),
    ];

    let help = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title(" Help "));
    f.render_widget(help, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let view_name = match &app.current_view {
        View::TaskList => "Tasks",
        View::TaskDetail(_) => "Task Detail",
        View::ScheduleList => "Schedules",
        View::ScheduleDetail(_) => "Schedule Detail",
        View::Help => "Help",
    };

    let queued_count = app.tasks.iter().filter(|t| t.status == TaskStatus::Queued).count();

    let status_msg = app.status_message.as_deref().unwrap_or("");

    let bar = Line::from(vec![
        Span::styled(format!(" {view_name} "), Style::default().bg(Color::Blue).fg(Color::White)),
        Span::raw("  "),
        if queued_count > 0 {
            Span::styled(format!("{queued_count} queued"), Style::default().fg(Color::Yellow))
        } else {
            Span::styled("no tasks queued", Style::default().fg(Color::DarkGray))
        },
        Span::raw("  "),
        Span::styled(status_msg, Style::default().fg(Color::Green)),
        Span::raw("  q:quit  ?:help  Tab:switch view"),
    ]);

    f.render_widget(Paragraph::new(bar), area);
}

// -- Helpers --

fn schedule_status_colored(status: &ScheduleStatus) -> Span<'static> {
    let (text, color) = match status {
        ScheduleStatus::Active => ("active", Color::Green),
        ScheduleStatus::Paused => ("paused", Color::Yellow),
        ScheduleStatus::Completed => ("completed", Color::Blue),
        ScheduleStatus::Cancelled => ("cancelled", Color::DarkGray),
        ScheduleStatus::Expired => ("expired", Color::DarkGray),
        ScheduleStatus::Failed => ("failed", Color::Red),
    };
    Span::styled(text.to_string(), Style::default().fg(color))
}

fn task_status_colored(status: &TaskStatus) -> Span<'static> {
    let (text, color) = match status {
        TaskStatus::Queued => ("queued", Color::DarkGray),
        TaskStatus::Running => ("running", Color::Blue),
        TaskStatus::Completed => ("completed", Color::Green),
        TaskStatus::Failed => ("failed", Color::Red),
        TaskStatus::Cancelled => ("cancelled", Color::Magenta),
    };
    Span::styled(text.to_string(), Style::default().fg(color))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
