use anyhow::Result;
use bankgreen::admin::{brand_changelist, datasource_changelist, Changelist, BRAND_ADMIN, DATASOURCE_ADMIN};
use bankgreen::brand::get_brand;
use bankgreen::control::{control_summary, ControlSummary};
use bankgreen::datasource::{get_record, DatasourceKind, DatasourceRecord};
use bankgreen::query::{BrandFilter, PageRequest, RecordFilter};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use rusqlite::Connection;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Datasources,
    Brands,
    Filters,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::Datasources => Page::Brands,
            Page::Brands => Page::Filters,
            Page::Filters => Page::Datasources,
        }
    }

    pub fn previous(&self) -> Self {
        match self {
            Page::Datasources => Page::Filters,
            Page::Brands => Page::Datasources,
            Page::Filters => Page::Brands,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::Datasources => "Datasources",
            Page::Brands => "Brands",
            Page::Filters => "Filters",
        }
    }
}

/// None -> yes -> no -> None
fn cycle_flag(flag: Option<bool>) -> Option<bool> {
    match flag {
        None => Some(true),
        Some(true) => Some(false),
        Some(false) => None,
    }
}

/// All kinds, then back to no kind filter
fn cycle_kind(kind: Option<DatasourceKind>) -> Option<DatasourceKind> {
    match kind {
        None => Some(DatasourceKind::ALL[0]),
        Some(k) => DatasourceKind::ALL
            .iter()
            .position(|x| *x == k)
            .and_then(|i| DatasourceKind::ALL.get(i + 1))
            .copied(),
    }
}

fn flag_label(flag: Option<bool>) -> &'static str {
    match flag {
        None => "all",
        Some(true) => "yes",
        Some(false) => "no",
    }
}

/// Selected record plus what the detail panel shows about it
pub struct Detail {
    pub record: DatasourceRecord,
    pub control: ControlSummary,
    pub brand_tag: Option<String>,
}

pub struct App {
    pub current_page: Page,
    pub filter: RecordFilter,
    pub brand_filter: BrandFilter,
    pub datasources: Changelist,
    pub brands: Changelist,
    pub state: TableState,
    pub brand_state: TableState,
    pub show_detail: bool,
    pub detail: Option<Detail>,
    /// Some while the operator types a search term
    pub search_input: Option<String>,
    pub message: Option<String>,
}

fn select_first(state: &mut TableState, len: usize) {
    state.select(if len == 0 { None } else { Some(0) });
}

fn move_selection(state: &mut TableState, len: usize, delta: isize) {
    if len == 0 {
        state.select(None);
        return;
    }
    let current = state.selected().unwrap_or(0) as isize;
    let next = (current + delta).clamp(0, len as isize - 1);
    state.select(Some(next as usize));
}

impl App {
    pub fn new(conn: &Connection) -> Result<Self> {
        let filter = RecordFilter::default();
        let brand_filter = BrandFilter::default();
        let datasources = datasource_changelist(conn, &filter, &PageRequest::all())?;
        let brands = brand_changelist(conn, &brand_filter, &PageRequest::all())?;

        let mut state = TableState::default();
        select_first(&mut state, datasources.rows.len());
        let mut brand_state = TableState::default();
        select_first(&mut brand_state, brands.rows.len());

        Ok(Self {
            current_page: Page::Datasources,
            filter,
            brand_filter,
            datasources,
            brands,
            state,
            brand_state,
            show_detail: false,
            detail: None,
            search_input: None,
            message: None,
        })
    }

    /// Reload both changelists after a filter change
    pub fn refresh(&mut self, conn: &Connection) -> Result<()> {
        self.brand_filter.search = self.filter.search.clone();
        self.brand_filter.country = self.filter.country.clone();
        self.datasources = datasource_changelist(conn, &self.filter, &PageRequest::all())?;
        self.brands = brand_changelist(conn, &self.brand_filter, &PageRequest::all())?;
        select_first(&mut self.state, self.datasources.rows.len());
        select_first(&mut self.brand_state, self.brands.rows.len());
        self.detail = None;
        self.show_detail = false;
        Ok(())
    }

    pub fn selected_record_id(&self) -> Option<i64> {
        self.state
            .selected()
            .and_then(|i| self.datasources.rows.get(i))
            .map(|row| row.id)
    }

    pub fn toggle_detail(&mut self, conn: &Connection) -> Result<()> {
        if self.show_detail {
            self.show_detail = false;
            self.detail = None;
            return Ok(());
        }
        let Some(id) = self.selected_record_id() else {
            return Ok(());
        };

        let record = get_record(conn, id)?;
        let control = control_summary(conn, &record)?;
        let brand_tag = match record.brand_id {
            Some(brand_id) => Some(get_brand(conn, brand_id)?.tag),
            None => None,
        };
        self.detail = Some(Detail {
            record,
            control,
            brand_tag,
        });
        self.show_detail = true;
        Ok(())
    }

    fn active_table(&mut self) -> (&mut TableState, usize) {
        match self.current_page {
            Page::Brands => (&mut self.brand_state, self.brands.rows.len()),
            _ => (&mut self.state, self.datasources.rows.len()),
        }
    }

    pub fn next(&mut self) {
        let (state, len) = self.active_table();
        move_selection(state, len, 1);
    }

    pub fn previous(&mut self) {
        let (state, len) = self.active_table();
        move_selection(state, len, -1);
    }

    pub fn page_down(&mut self) {
        let (state, len) = self.active_table();
        move_selection(state, len, 20);
    }

    pub fn page_up(&mut self) {
        let (state, len) = self.active_table();
        move_selection(state, len, -20);
    }

    /// Apply one key press. Returns true when the app should quit.
    pub fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers, conn: &Connection) -> Result<bool> {
        if let Some(input) = self.search_input.as_mut() {
            match code {
                KeyCode::Enter => {
                    let term = input.trim().to_string();
                    self.filter.search = if term.is_empty() { None } else { Some(term) };
                    self.search_input = None;
                    self.refresh(conn)?;
                }
                KeyCode::Esc => self.search_input = None,
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(c) => input.push(c),
                _ => {}
            }
            return Ok(false);
        }

        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Enter if self.current_page == Page::Datasources => self.toggle_detail(conn)?,
            KeyCode::Tab | KeyCode::BackTab => {
                self.current_page = if code == KeyCode::BackTab || modifiers.contains(KeyModifiers::SHIFT) {
                    self.current_page.previous()
                } else {
                    self.current_page.next()
                };
                self.show_detail = false;
            }
            KeyCode::Char('/') => self.search_input = Some(self.filter.search.clone().unwrap_or_default()),
            KeyCode::Char('c') => {
                self.filter.controlled = cycle_flag(self.filter.controlled);
                self.refresh(conn)?;
            }
            KeyCode::Char('l') => {
                self.filter.linked = cycle_flag(self.filter.linked);
                self.refresh(conn)?;
            }
            KeyCode::Char('r') => {
                self.filter.has_regions = cycle_flag(self.filter.has_regions);
                self.refresh(conn)?;
            }
            KeyCode::Char('p') => {
                self.filter.kind = cycle_kind(self.filter.kind);
                self.refresh(conn)?;
            }
            KeyCode::Char('x') => {
                self.filter = RecordFilter::default();
                self.refresh(conn)?;
            }
            KeyCode::Down | KeyCode::Char('j') => self.next(),
            KeyCode::Up | KeyCode::Char('k') => self.previous(),
            KeyCode::PageDown => self.page_down(),
            KeyCode::PageUp => self.page_up(),
            _ => {}
        }
        Ok(false)
    }
}

pub fn run_ui(app: &mut App, conn: &Connection) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app, conn);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App, conn: &Connection) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            match app.handle_key(key.code, key.modifiers, conn) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "admin action failed");
                    app.message = Some(e.to_string());
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    if app.show_detail && app.current_page == Page::Datasources {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[1]);

        render_changelist(f, content_chunks[0], &app.datasources, &mut app.state, " Datasources ");
        render_detail_panel(f, content_chunks[1], app);
    } else {
        match app.current_page {
            Page::Datasources => {
                render_changelist(f, chunks[1], &app.datasources, &mut app.state, " Datasources ")
            }
            Page::Brands => render_changelist(f, chunks[1], &app.brands, &mut app.brand_state, " Brands "),
            Page::Filters => render_filters(f, chunks[1], app),
        }
    }

    render_status_bar(f, chunks[2], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let mut tab_spans = vec![];
    for (i, page) in [Page::Datasources, Page::Brands, Page::Filters].iter().enumerate() {
        if i > 0 {
            tab_spans.push(Span::raw(" │ "));
        }
        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        tab_spans.push(Span::styled(page.title().to_string(), style));
    }

    tab_spans.push(Span::raw("  |  "));
    tab_spans.push(Span::styled(
        format!("Records: {}", app.datasources.count),
        Style::default().fg(Color::White),
    ));
    tab_spans.push(Span::raw("  "));
    tab_spans.push(Span::styled(
        format!("Brands: {}", app.brands.count),
        Style::default().fg(Color::Green),
    ));

    let header = Paragraph::new(vec![Line::from(tab_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));
    f.render_widget(header, area);
}

fn render_changelist(f: &mut Frame, area: Rect, list: &Changelist, state: &mut TableState, title: &str) {
    let header_cells = list.columns.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows = list.rows.iter().map(|row| {
        let cells = row.cells.iter().map(|c| Cell::from(truncate(c, 40)));
        Row::new(cells).height(1)
    });

    let widths: Vec<Constraint> = list
        .columns
        .iter()
        .map(|c| match *c {
            "name" => Constraint::Percentage(30),
            "website" => Constraint::Percentage(25),
            _ => Constraint::Min(8),
        })
        .collect();

    let table = Table::new(rows, widths)
        .header(header)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(title.to_string()),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, state);
}

fn render_filters(f: &mut Frame, area: Rect, app: &App) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    let filter = &app.filter;

    let content = vec![
        Line::from(""),
        Line::from(vec![Span::styled(
            "  DATASOURCE FILTERS",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        )]),
        Line::from(""),
        Line::from(vec![
            Span::raw("  "),
            key("p"),
            Span::raw(format!("  Provider:   {}", filter.kind.map(|k| k.name()).unwrap_or("all"))),
        ]),
        Line::from(vec![
            Span::raw("  "),
            key("c"),
            Span::raw(format!("  Controlled: {}", flag_label(filter.controlled))),
        ]),
        Line::from(vec![
            Span::raw("  "),
            key("l"),
            Span::raw(format!("  Linked:     {}", flag_label(filter.linked))),
        ]),
        Line::from(vec![
            Span::raw("  "),
            key("r"),
            Span::raw(format!("  Regions:    {}", flag_label(filter.has_regions))),
        ]),
        Line::from(vec![
            Span::raw("  "),
            key("/"),
            Span::raw(format!("  Search:     {}", filter.search.as_deref().unwrap_or("-"))),
        ]),
        Line::from(""),
        Line::from(vec![Span::raw("  "), key("x"), Span::raw("  Clear all filters")]),
        Line::from(""),
        Line::from(vec![Span::styled(
            format!(
                "  Datasource search covers {}; brand search covers {}",
                DATASOURCE_ADMIN.search_fields.join(", "),
                BRAND_ADMIN.search_fields.join(", ")
            ),
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )]),
    ];

    let paragraph = Paragraph::new(content).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .title(" Filters "),
    );
    f.render_widget(paragraph, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let mut status_spans = vec![];

    if let Some(input) = &app.search_input {
        status_spans.push(Span::styled(" Search: ", Style::default().fg(Color::Cyan)));
        status_spans.push(Span::raw(format!("{}_", input)));
        status_spans.push(Span::raw("  (Enter apply, Esc cancel)"));
    } else {
        let (state, len) = match app.current_page {
            Page::Brands => (&app.brand_state, app.brands.rows.len()),
            _ => (&app.state, app.datasources.rows.len()),
        };
        let selected = state.selected().map(|i| i + 1).unwrap_or(0);
        status_spans.push(Span::styled(
            format!(" Row: {}/{} ", selected, len),
            Style::default().fg(Color::Cyan),
        ));

        if let Some(message) = &app.message {
            status_spans.push(Span::raw(" | "));
            status_spans.push(Span::styled(message.clone(), Style::default().fg(Color::Red)));
        }

        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled("Enter", Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(" Details | "));
        status_spans.push(Span::styled("Tab", Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(" Page | "));
        status_spans.push(Span::styled("/", Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(" Search | "));
        status_spans.push(Span::styled("q", Style::default().fg(Color::Red)));
        status_spans.push(Span::raw(" Quit"));
    }

    let status_bar = Paragraph::new(vec![Line::from(status_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::White)));
    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Record Details ");

    let Some(detail) = &app.detail else {
        f.render_widget(Paragraph::new("No record selected").block(block), area);
        return;
    };
    let record = &detail.record;
    let label = |text: String| Span::styled(text, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));
    let section = |text: &'static str| {
        Line::from(vec![Span::styled(
            text,
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        )])
    };

    let mut content = vec![
        Line::from(""),
        Line::from(vec![label("  Name: ".to_string()), Span::raw(record.name.clone())]),
        Line::from(vec![label("  Provider: ".to_string()), Span::raw(record.kind.name())]),
        Line::from(vec![label("  Tag: ".to_string()), Span::raw(record.tag.clone())]),
        Line::from(vec![
            label("  Brand: ".to_string()),
            Span::styled(
                detail.brand_tag.clone().unwrap_or_else(|| "-".to_string()),
                Style::default().fg(Color::Green),
            ),
        ]),
        Line::from(""),
        section("  IDENTIFIERS"),
    ];

    let identifiers = record.identifiers.present();
    if identifiers.is_empty() {
        content.push(Line::from("  -"));
    }
    for (name, value) in identifiers {
        content.push(Line::from(vec![label(format!("  {}: ", name)), Span::raw(value.to_string())]));
    }

    content.push(Line::from(""));
    content.push(section("  CONTROL"));
    if detail.control.independent {
        content.push(Line::from("  Independent"));
    }
    for controller in &detail.control.controllers {
        content.push(Line::from(vec![
            label(format!("  {}: ", controller.rssd)),
            Span::raw(format!("{} ({})", controller.name, controller.kind)),
        ]));
    }
    for rssd in &detail.control.unresolved {
        content.push(Line::from(vec![
            label(format!("  {}: ", rssd)),
            Span::styled("not in catalog", Style::default().fg(Color::DarkGray)),
        ]));
    }

    if record.has_regions() {
        content.push(Line::from(""));
        content.push(section("  REGIONS"));
        content.push(Line::from(format!("  {}", record.regions.join(", "))));
    }

    content.push(Line::from(""));
    content.push(Line::from(vec![Span::styled(
        "  Press Enter to close",
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
    )]));

    f.render_widget(Paragraph::new(content).block(block), area);
}
