use std::env;
use std::fs;
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Appended to the display label of directories that are runnable stacks.
const UNIT_SUFFIX: &str = " ✦";

/// Directories never worth descending into. Dot-directories are skipped
/// unconditionally, which also covers version control and tool caches.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "__pycache__",
    "terraform.tfstate.d",
];

const MIN_VISIBLE_COLUMNS: usize = 1;
const ACTION_COLUMN_WIDTH: u16 = 18;
const PLAN_FILE: &str = "tfplan.json";
const HISTORY_LIMIT: usize = 20;

fn main() -> Result<()> {
    let cli = parse_args(env::args().skip(1))?;
    if cli.show_help {
        print_usage();
        return Ok(());
    }

    if cli.show_history {
        let history = History::open_default()?;
        for run in history.recent(HISTORY_LIMIT)? {
            println!("{}  {:<10}  {}", run.started_at, run.command, run.path);
        }
        return Ok(());
    }

    let config = load_config()?;
    let root = fs::canonicalize(&cli.root)
        .with_context(|| format!("cannot resolve root {}", cli.root.display()))?;
    let scan = scan_stacks(&root, &config.unit_file)?;

    let mut app = App::new(scan, config, root);
    let mut tui = Tui::new()?;

    let run_result = run_app(&mut tui, &mut app);
    let restore_result = tui.restore();

    run_result?;
    restore_result?;

    if let Some(selection) = app.outcome.as_ref() {
        if let Err(err) =
            History::open_default().and_then(|h| h.record(&selection.command, &selection.path))
        {
            eprintln!("warning: failed to record run: {err:#}");
        }
        // The shell-ready line is the whole output contract; the caller runs it.
        println!(
            "cd {} && {} {}",
            selection.path.display(),
            app.runner,
            selection.command
        );
    }

    Ok(())
}

fn run_app(tui: &mut Tui, app: &mut App) -> Result<()> {
    loop {
        tui.draw(app)?;

        if app.should_quit {
            return Ok(());
        }

        if !event::poll(Duration::from_millis(150))? {
            continue;
        }

        match event::read()? {
            Event::Key(key) => {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match app.mode {
                    Mode::Browse => handle_browse_mode(key.code, app),
                    Mode::Filter => handle_filter_mode(key.code, app),
                    Mode::Plan => handle_plan_mode(key.code, app),
                }
            }
            Event::Resize(_, _) => app.realign_scrolls(),
            _ => {}
        }
    }
}

fn handle_browse_mode(code: KeyCode, app: &mut App) {
    match code {
        KeyCode::Char('q') => app.should_quit = true,
        KeyCode::Char('/') => app.mode = Mode::Filter,
        KeyCode::Up | KeyCode::Char('k') => app.move_up(),
        KeyCode::Down | KeyCode::Char('j') => app.move_down(),
        KeyCode::Left | KeyCode::Char('h') | KeyCode::BackTab => app.move_left(),
        KeyCode::Right | KeyCode::Char('l') | KeyCode::Tab => app.move_right(),
        KeyCode::Home => app.select_first(),
        KeyCode::End => app.select_last(),
        KeyCode::Enter => app.confirm(),
        KeyCode::Char('g') => app.rescan(),
        KeyCode::Char('v') => app.open_plan(),
        KeyCode::Esc => app.clear_focused_filter(),
        _ => {}
    }
}

fn handle_filter_mode(code: KeyCode, app: &mut App) {
    match code {
        KeyCode::Esc => {
            app.clear_focused_filter();
            app.mode = Mode::Browse;
        }
        KeyCode::Enter => app.mode = Mode::Browse,
        KeyCode::Backspace => app.edit_filter(|filter| {
            filter.pop();
        }),
        KeyCode::Char(ch) => app.edit_filter(|filter| filter.push(ch)),
        KeyCode::Up => app.move_up(),
        KeyCode::Down => app.move_down(),
        // Horizontal movement leaves filter editing; the text stays applied.
        KeyCode::Left => app.move_left(),
        KeyCode::Right => app.move_right(),
        _ => {}
    }
}

fn handle_plan_mode(code: KeyCode, app: &mut App) {
    match code {
        KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('v') => {
            app.plan = None;
            app.mode = Mode::Browse;
        }
        KeyCode::Up | KeyCode::Char('k') => {
            if let Some(plan) = app.plan.as_mut() {
                plan.scroll = plan.scroll.saturating_sub(1);
            }
        }
        KeyCode::Down | KeyCode::Char('j') => {
            if let Some(plan) = app.plan.as_mut() {
                // Paragraph::scroll takes a u16 row offset; cap there.
                plan.scroll = (plan.scroll + 1)
                    .min(plan.lines.len().saturating_sub(1))
                    .min(u16::MAX as usize);
            }
        }
        _ => {}
    }
}

struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Tui {
    fn new() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend).context("failed to create terminal")?;
        Ok(Self { terminal })
    }

    fn draw(&mut self, app: &mut App) -> Result<()> {
        self.terminal.draw(|frame| {
            let root = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(3),
                    Constraint::Min(8),
                    Constraint::Length(5),
                ])
                .split(frame.area());

            app.sync_viewport(root[1].height.saturating_sub(2) as usize);
            render_breadcrumb(frame, root[0], app);
            render_columns(frame, root[1], app);
            render_status(frame, root[2], app);
            if app.mode == Mode::Plan {
                render_plan(frame, frame.area(), app);
            }
        })?;

        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        disable_raw_mode().context("failed to disable raw mode")?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)
            .context("failed to leave alternate screen")?;
        Ok(())
    }
}

struct CliArgs {
    root: PathBuf,
    show_history: bool,
    show_help: bool,
}

fn parse_args<I: Iterator<Item = String>>(args: I) -> Result<CliArgs> {
    let mut cli = CliArgs {
        root: PathBuf::from("."),
        show_history: false,
        show_help: false,
    };

    for arg in args {
        match arg.as_str() {
            "--history" => cli.show_history = true,
            "-h" | "--help" => cli.show_help = true,
            other if other.starts_with('-') => bail!("unknown flag: {other}"),
            other => cli.root = expand_tilde(other),
        }
    }

    Ok(cli)
}

fn print_usage() {
    println!(
        "stacknav {} - pick a command and a stack, emit the run line\n\n\
         usage: stacknav [ROOT]\n\n\
         flags:\n\
         \x20 --history    print recent runs and exit\n\
         \x20 -h, --help   show this help\n\n\
         config: ~/.config/stacknav/config.toml (or STACKNAV_CONFIG)",
        env!("CARGO_PKG_VERSION")
    );
}

#[derive(Deserialize)]
#[serde(default)]
struct Config {
    commands: Vec<String>,
    runner: String,
    unit_file: String,
    visible_columns: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            commands: ["plan", "apply", "destroy", "output", "init", "validate"]
                .into_iter()
                .map(String::from)
                .collect(),
            runner: String::from("terragrunt"),
            unit_file: String::from("terragrunt.hcl"),
            visible_columns: 3,
        }
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("STACKNAV_CONFIG") {
        let expanded = expand_tilde(path.trim());
        if !expanded.as_os_str().is_empty() {
            return Some(expanded);
        }
    }

    let home = env::var("HOME").ok()?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("stacknav")
            .join("config.toml"),
    )
}

fn load_config() -> Result<Config> {
    let Some(path) = resolve_config_path() else {
        return Ok(Config::default());
    };
    if !path.is_file() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config: Config =
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;

    if config.commands.is_empty() {
        config.commands = Config::default().commands;
    }
    config.visible_columns = config.visible_columns.max(MIN_VISIBLE_COLUMNS);
    Ok(config)
}

/// One directory segment of the scanned hierarchy. Nodes live in the flat
/// arena on [`StackTree`]; `children` holds arena indices.
#[derive(Clone, Debug)]
struct StackNode {
    name: String,
    path: PathBuf,
    is_unit: bool,
    depth: usize,
    children: Vec<usize>,
}

#[derive(Debug)]
struct StackTree {
    nodes: Vec<StackNode>,
    root: usize,
    /// Number of navigation columns, i.e. the deepest included node's depth.
    max_depth: usize,
}

impl StackTree {
    fn node(&self, id: usize) -> &StackNode {
        &self.nodes[id]
    }

    fn children_of(&self, id: usize) -> &[usize] {
        &self.nodes[id].children
    }

    fn root_path(&self) -> &Path {
        &self.nodes[self.root].path
    }

    fn label(&self, id: usize) -> String {
        let node = &self.nodes[id];
        if node.is_unit {
            format!("{}{UNIT_SUFFIX}", node.name)
        } else {
            node.name.clone()
        }
    }

    fn unit_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_unit).count()
    }
}

#[derive(Debug)]
struct ScanOutcome {
    tree: StackTree,
    /// Directories whose listing failed; the branch was simply omitted.
    skipped: Vec<PathBuf>,
}

fn scan_stacks(root: &Path, unit_file: &str) -> Result<ScanOutcome> {
    let mut nodes = Vec::new();
    let mut skipped = Vec::new();
    let mut max_depth = 0;

    let root_id = scan_dir(root, 0, unit_file, &mut nodes, &mut skipped, &mut max_depth)
        .ok_or_else(|| {
            anyhow!(
                "no stacks found under {} (nothing contains {})",
                root.display(),
                unit_file
            )
        })?;

    Ok(ScanOutcome {
        tree: StackTree {
            nodes,
            root: root_id,
            max_depth,
        },
        skipped,
    })
}

/// Post-order descent: a directory is kept only if it is a unit itself or
/// its recursion produced at least one child, so pruned branches never
/// reach the arena and never inflate `max_depth`.
fn scan_dir(
    dir: &Path,
    depth: usize,
    unit_file: &str,
    nodes: &mut Vec<StackNode>,
    skipped: &mut Vec<PathBuf>,
    max_depth: &mut usize,
) -> Option<usize> {
    let is_unit = dir.join(unit_file).is_file();
    let mut children = Vec::new();

    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut subdirs: Vec<PathBuf> = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                    continue;
                };
                if name.starts_with('.') || SKIP_DIRS.contains(&name) {
                    continue;
                }
                subdirs.push(path);
            }
            subdirs.sort();

            for sub in subdirs {
                if let Some(child) = scan_dir(&sub, depth + 1, unit_file, nodes, skipped, max_depth)
                {
                    children.push(child);
                }
            }
        }
        Err(_) => skipped.push(dir.to_path_buf()),
    }

    if !is_unit && children.is_empty() {
        return None;
    }

    if depth > *max_depth {
        *max_depth = depth;
    }

    let name = dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("/")
        .to_string();
    let id = nodes.len();
    nodes.push(StackNode {
        name,
        path: dir.to_path_buf(),
        is_unit,
        depth,
        children,
    });
    Some(id)
}

/// Per-depth cursor state over a fixed [`StackTree`]. `columns[d]` holds
/// the labels visible at depth `d`, `node_at[d]` the arena index resolved
/// by the selections up to and including `d` (`None` past a leaf).
#[derive(Clone)]
struct NavState {
    columns: Vec<Vec<String>>,
    selected: Vec<usize>,
    node_at: Vec<Option<usize>>,
}

impl NavState {
    fn new(max_depth: usize) -> Self {
        Self {
            columns: vec![Vec::new(); max_depth],
            selected: vec![0; max_depth],
            node_at: vec![None; max_depth],
        }
    }

    fn depth_count(&self) -> usize {
        self.columns.len()
    }
}

/// The single authoritative re-derivation step: walks from the root
/// following `selected`, republishing every column on the way. Must run
/// after any index mutation, since a change at depth `d` invalidates
/// everything deeper. Out-of-range indices are clamped to 0, never an
/// error. Returns the deepest resolved node.
fn propagate_selection(tree: &StackTree, nav: &mut NavState) -> usize {
    let mut current = tree.root;

    for depth in 0..nav.depth_count() {
        let children = tree.children_of(current);
        if children.is_empty() {
            clear_columns_from(nav, depth);
            return current;
        }

        nav.columns[depth] = children.iter().map(|&id| tree.label(id)).collect();
        if nav.selected[depth] >= children.len() {
            nav.selected[depth] = 0;
        }
        current = children[nav.selected[depth]];
        nav.node_at[depth] = Some(current);
    }

    current
}

fn clear_columns_from(nav: &mut NavState, depth: usize) {
    for d in depth..nav.depth_count() {
        nav.columns[d].clear();
        nav.selected[d] = 0;
        nav.node_at[d] = None;
    }
}

fn can_move_up(nav: &NavState, depth: usize) -> bool {
    nav.selected.get(depth).is_some_and(|&idx| idx > 0)
}

fn can_move_down(nav: &NavState, depth: usize) -> bool {
    match (nav.selected.get(depth), nav.columns.get(depth)) {
        (Some(&idx), Some(column)) => !column.is_empty() && idx < column.len() - 1,
        _ => false,
    }
}

/// How many columns currently have content. Pruning and leaf termination
/// make this smaller than the structural `max_depth` most of the time.
fn max_visible_depth(nav: &NavState) -> usize {
    for depth in (0..nav.depth_count()).rev() {
        if !nav.columns[depth].is_empty() {
            return depth + 1;
        }
    }
    0
}

/// Display path for the selection chain up to `depth` inclusive. Stale
/// indices are skipped rather than erroring; path rendering never fails.
fn navigation_path(tree: &StackTree, nav: &NavState, depth: isize) -> String {
    let mut path = tree.root_path().display().to_string();
    if depth < 0 || nav.depth_count() == 0 {
        return path;
    }

    let last = (depth as usize).min(nav.depth_count() - 1);
    for d in 0..=last {
        let Some(label) = nav.columns[d].get(nav.selected[d]) else {
            continue;
        };
        path.push('/');
        path.push_str(strip_unit_suffix(label));
    }
    path
}

fn strip_unit_suffix(label: &str) -> &str {
    label.strip_suffix(UNIT_SUFFIX).unwrap_or(label)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Focus {
    Actions,
    Nav(usize),
}

/// Column ids: 0 is the action column, navigation depth `d` is `d + 1`.
fn column_id(focus: Focus) -> usize {
    match focus {
        Focus::Actions => 0,
        Focus::Nav(depth) => depth + 1,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Browse,
    Filter,
    Plan,
}

#[derive(Clone, Copy)]
enum VerticalStep {
    Up,
    Down,
}

fn step_cyclic(pos: usize, len: usize, step: VerticalStep) -> usize {
    match step {
        VerticalStep::Down => {
            if pos + 1 >= len {
                0
            } else {
                pos + 1
            }
        }
        VerticalStep::Up => {
            if pos == 0 {
                len - 1
            } else {
                pos - 1
            }
        }
    }
}

fn page_start(pos: usize, page: usize) -> usize {
    let page = page.max(1);
    (pos / page) * page
}

/// Indices into `items` whose label passes the case-insensitive substring
/// filter; the identity sequence when no filter is active.
fn filtered_indices(items: &[String], filter: &str) -> Vec<usize> {
    if filter.is_empty() {
        return (0..items.len()).collect();
    }

    let needle = filter.to_lowercase();
    items
        .iter()
        .enumerate()
        .filter(|(_, label)| label.to_lowercase().contains(&needle))
        .map(|(idx, _)| idx)
        .collect()
}

/// Position of the current selection inside the filtered subsequence, by
/// value equality on the label rather than by raw index. `None` means the
/// selection was filtered out and movement should fall back to the first
/// filtered item.
fn filtered_position(items: &[String], filtered: &[usize], selected: usize) -> Option<usize> {
    let current = items.get(selected)?;
    filtered.iter().position(|&idx| items[idx] == *current)
}

fn unfiltered_index(items: &[String], label: &str) -> Option<usize> {
    items.iter().position(|item| item == label)
}

struct RunSelection {
    command: String,
    path: PathBuf,
}

struct PlanView {
    title: String,
    lines: Vec<Line<'static>>,
    scroll: usize,
}

struct App {
    tree: StackTree,
    nav: NavState,
    commands: Vec<String>,
    runner: String,
    unit_file: String,
    root_dir: PathBuf,

    focus: Focus,
    action_idx: usize,
    window_offset: usize,
    visible_columns: usize,
    // Fixed per-column-id slots; empty string / 0 mean "no entry".
    filters: Vec<String>,
    scrolls: Vec<usize>,
    column_rows: usize,

    mode: Mode,
    plan: Option<PlanView>,
    status: String,
    skipped: usize,
    outcome: Option<RunSelection>,
    should_quit: bool,
}

impl App {
    fn new(scan: ScanOutcome, config: Config, root_dir: PathBuf) -> Self {
        let max_depth = scan.tree.max_depth;
        let mut app = Self {
            tree: scan.tree,
            nav: NavState::new(max_depth),
            commands: config.commands,
            runner: config.runner,
            unit_file: config.unit_file,
            root_dir,
            focus: Focus::Actions,
            action_idx: 0,
            window_offset: 0,
            visible_columns: config.visible_columns.max(MIN_VISIBLE_COLUMNS),
            filters: vec![String::new(); max_depth + 1],
            scrolls: vec![0; max_depth + 1],
            column_rows: 1,
            mode: Mode::Browse,
            plan: None,
            status: String::new(),
            skipped: scan.skipped.len(),
            outcome: None,
            should_quit: false,
        };

        propagate_selection(&app.tree, &mut app.nav);
        app.status = scan_summary(&app.tree, app.skipped);
        app
    }

    fn column_items(&self, target: Focus) -> &[String] {
        match target {
            Focus::Actions => &self.commands,
            Focus::Nav(depth) => self
                .nav
                .columns
                .get(depth)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }

    fn selected_in(&self, target: Focus) -> usize {
        match target {
            Focus::Actions => self.action_idx,
            Focus::Nav(depth) => self.nav.selected.get(depth).copied().unwrap_or(0),
        }
    }

    fn set_selected(&mut self, target: Focus, index: usize) {
        match target {
            Focus::Actions => self.action_idx = index,
            Focus::Nav(depth) => {
                if let Some(slot) = self.nav.selected.get_mut(depth) {
                    *slot = index;
                    propagate_selection(&self.tree, &mut self.nav);
                }
            }
        }
    }

    fn filter_for(&self, col: usize) -> &str {
        self.filters.get(col).map(String::as_str).unwrap_or("")
    }

    fn move_up(&mut self) {
        self.move_vertical(VerticalStep::Up);
    }

    fn move_down(&mut self) {
        self.move_vertical(VerticalStep::Down);
    }

    /// Cyclic vertical movement over the filtered subsequence of the
    /// focused column, with page-aligned scrolling: crossing a page
    /// boundary lands the scroll offset on that page's start.
    fn move_vertical(&mut self, step: VerticalStep) {
        let target = self.focus;
        let col = column_id(target);
        let items = self.column_items(target).to_vec();
        if items.is_empty() {
            return;
        }

        let filtered = filtered_indices(&items, self.filter_for(col));
        if filtered.is_empty() {
            return;
        }

        let pos = match filtered_position(&items, &filtered, self.selected_in(target)) {
            Some(pos) => step_cyclic(pos, filtered.len(), step),
            // The selection is not in the filtered subsequence (the filter
            // just changed): jump to the first filtered item instead.
            None => 0,
        };

        let label = items[filtered[pos]].clone();
        let index = unfiltered_index(&items, &label).unwrap_or(filtered[pos]);
        self.set_selected(target, index);
        if let Some(scroll) = self.scrolls.get_mut(col) {
            *scroll = page_start(pos, self.column_rows);
        }
    }

    // The raw-index shortcuts only apply without a filter; a filtered-out
    // selection still has to land on the filtered edge.
    fn select_first(&mut self) {
        if let Focus::Nav(depth) = self.focus
            && self.filter_for(column_id(self.focus)).is_empty()
            && !can_move_up(&self.nav, depth)
        {
            return;
        }
        self.select_filtered_edge(true);
    }

    fn select_last(&mut self) {
        if let Focus::Nav(depth) = self.focus
            && self.filter_for(column_id(self.focus)).is_empty()
            && !can_move_down(&self.nav, depth)
        {
            return;
        }
        self.select_filtered_edge(false);
    }

    fn select_filtered_edge(&mut self, first: bool) {
        let target = self.focus;
        let col = column_id(target);
        let items = self.column_items(target).to_vec();
        let filtered = filtered_indices(&items, self.filter_for(col));
        if filtered.is_empty() {
            return;
        }

        let pos = if first { 0 } else { filtered.len() - 1 };
        let label = items[filtered[pos]].clone();
        let index = unfiltered_index(&items, &label).unwrap_or(filtered[pos]);
        self.set_selected(target, index);
        if let Some(scroll) = self.scrolls.get_mut(col) {
            *scroll = page_start(pos, self.column_rows);
        }
    }

    fn move_right(&mut self) {
        if self.mode == Mode::Filter {
            self.mode = Mode::Browse;
        }

        match self.focus {
            Focus::Actions => {
                if max_visible_depth(&self.nav) == 0 {
                    return;
                }
                self.focus = Focus::Nav(0);
                self.window_offset = 0;
            }
            Focus::Nav(depth) => {
                if depth + 1 < max_visible_depth(&self.nav) {
                    let next = depth + 1;
                    self.focus = Focus::Nav(next);
                    if next > self.window_offset + self.visible_columns - 1 {
                        self.window_offset += 1;
                    }
                } else {
                    // Past the last visible depth: wrap to the action column.
                    self.focus = Focus::Actions;
                    self.window_offset = 0;
                }
            }
        }

        self.revalidate_selection(self.focus);
    }

    fn move_left(&mut self) {
        if self.mode == Mode::Filter {
            self.mode = Mode::Browse;
        }

        match self.focus {
            Focus::Actions => {
                let reachable = max_visible_depth(&self.nav);
                if reachable == 0 {
                    return;
                }
                let last = reachable - 1;
                self.focus = Focus::Nav(last);
                self.window_offset = last.saturating_sub(self.visible_columns - 1);
            }
            Focus::Nav(0) => self.focus = Focus::Actions,
            Focus::Nav(depth) => {
                let prev = depth - 1;
                self.focus = Focus::Nav(prev);
                if prev < self.window_offset {
                    self.window_offset -= 1;
                }
            }
        }

        self.revalidate_selection(self.focus);
    }

    /// Re-checks the current selection against the column's filter, jumping
    /// to the first filtered item when it no longer matches, and realigns
    /// the scroll offset. Runs on arrival after horizontal moves and after
    /// every filter edit.
    fn revalidate_selection(&mut self, target: Focus) {
        let col = column_id(target);
        let items = self.column_items(target).to_vec();
        let filtered = filtered_indices(&items, self.filter_for(col));
        if filtered.is_empty() {
            if let Some(scroll) = self.scrolls.get_mut(col) {
                *scroll = 0;
            }
            return;
        }

        let pos = match filtered_position(&items, &filtered, self.selected_in(target)) {
            Some(pos) => pos,
            None => {
                let label = items[filtered[0]].clone();
                let index = unfiltered_index(&items, &label).unwrap_or(filtered[0]);
                self.set_selected(target, index);
                0
            }
        };
        if let Some(scroll) = self.scrolls.get_mut(col) {
            *scroll = page_start(pos, self.column_rows);
        }
    }

    fn edit_filter(&mut self, edit: impl FnOnce(&mut String)) {
        let col = column_id(self.focus);
        if let Some(filter) = self.filters.get_mut(col) {
            edit(filter);
        }
        self.revalidate_selection(self.focus);
    }

    fn clear_focused_filter(&mut self) {
        let col = column_id(self.focus);
        if let Some(filter) = self.filters.get_mut(col) {
            filter.clear();
        }
        self.revalidate_selection(self.focus);
    }

    /// Dual confirm semantics: from the action column the command applies
    /// to the whole root; from a navigation column it applies to the node
    /// resolved at that depth, deeper selections ignored. A selection past
    /// a leaf is a no-op.
    fn confirm(&mut self) {
        let node_id = match self.focus {
            Focus::Actions => Some(self.tree.root),
            Focus::Nav(depth) => self.nav.node_at.get(depth).copied().flatten(),
        };
        let Some(node_id) = node_id else {
            self.status = String::from("nothing selected at this depth");
            return;
        };
        let Some(command) = self.commands.get(self.action_idx).cloned() else {
            return;
        };

        self.outcome = Some(RunSelection {
            command,
            path: self.tree.node(node_id).path.clone(),
        });
        self.should_quit = true;
    }

    fn rescan(&mut self) {
        match scan_stacks(&self.root_dir, &self.unit_file) {
            Ok(scan) => {
                let old_selected = std::mem::take(&mut self.nav.selected);
                self.tree = scan.tree;
                self.nav = NavState::new(self.tree.max_depth);
                for (depth, idx) in old_selected
                    .into_iter()
                    .enumerate()
                    .take(self.nav.depth_count())
                {
                    self.nav.selected[depth] = idx;
                }
                self.filters.resize(self.tree.max_depth + 1, String::new());
                self.scrolls = vec![0; self.tree.max_depth + 1];
                propagate_selection(&self.tree, &mut self.nav);

                if let Focus::Nav(depth) = self.focus
                    && depth >= max_visible_depth(&self.nav)
                {
                    self.focus = Focus::Actions;
                    self.window_offset = 0;
                }
                self.window_offset = self
                    .window_offset
                    .min(self.tree.max_depth.saturating_sub(self.visible_columns));
                self.action_idx = self.action_idx.min(self.commands.len().saturating_sub(1));
                self.skipped = scan.skipped.len();
                self.status = scan_summary(&self.tree, self.skipped);
                self.realign_scrolls();
            }
            Err(err) => self.status = format!("rescan failed: {err:#}"),
        }
    }

    fn open_plan(&mut self) {
        let node_id = match self.focus {
            Focus::Actions => self.tree.root,
            Focus::Nav(depth) => match self.nav.node_at.get(depth).copied().flatten() {
                Some(id) => id,
                None => {
                    self.status = String::from("no stack selected");
                    return;
                }
            },
        };

        let node = self.tree.node(node_id);
        let plan_path = node.path.join(PLAN_FILE);
        if !plan_path.is_file() {
            self.status = format!("no {PLAN_FILE} in {}", node.path.display());
            return;
        }

        match load_plan(&plan_path) {
            Ok(lines) => {
                self.plan = Some(PlanView {
                    title: format!("plan: {} (level {})", node.name, node.depth),
                    lines,
                    scroll: 0,
                });
                self.mode = Mode::Plan;
            }
            Err(err) => self.status = format!("failed to load plan: {err:#}"),
        }
    }

    fn sync_viewport(&mut self, rows: usize) {
        let rows = rows.max(1);
        if rows == self.column_rows {
            return;
        }
        self.column_rows = rows;
        self.realign_scrolls();
    }

    /// Realigns every scroll offset to the page containing its selection.
    /// Offsets never point past content, even across resizes.
    fn realign_scrolls(&mut self) {
        let mut targets = vec![Focus::Actions];
        for depth in 0..self.nav.depth_count() {
            targets.push(Focus::Nav(depth));
        }

        for target in targets {
            let col = column_id(target);
            let items = self.column_items(target).to_vec();
            let filtered = filtered_indices(&items, self.filter_for(col));
            let pos = filtered_position(&items, &filtered, self.selected_in(target)).unwrap_or(0);
            if let Some(scroll) = self.scrolls.get_mut(col) {
                *scroll = page_start(pos, self.column_rows);
            }
        }

        if let Some(plan) = self.plan.as_mut() {
            plan.scroll = plan.scroll.min(plan.lines.len().saturating_sub(1));
        }
    }

    fn focused_node(&self) -> Option<usize> {
        match self.focus {
            Focus::Actions => Some(self.tree.root),
            Focus::Nav(depth) => self.nav.node_at.get(depth).copied().flatten(),
        }
    }

    fn overflow_left(&self) -> bool {
        self.window_offset > 0
    }

    fn overflow_right(&self) -> bool {
        let beyond = self.window_offset + self.visible_columns < max_visible_depth(&self.nav);
        beyond
            && self
                .focused_node()
                .is_some_and(|id| !self.tree.children_of(id).is_empty())
    }

    fn breadcrumb(&self) -> String {
        match self.focus {
            Focus::Actions => self.tree.root_path().display().to_string(),
            Focus::Nav(depth) => navigation_path(&self.tree, &self.nav, depth as isize),
        }
    }

    fn column_title(&self, target: Focus) -> String {
        let base = match target {
            Focus::Actions => self.runner.clone(),
            Focus::Nav(depth) => {
                let parent = if depth == 0 {
                    Some(self.tree.root)
                } else {
                    self.nav.node_at.get(depth - 1).copied().flatten()
                };
                parent
                    .map(|id| self.tree.node(id).name.clone())
                    .unwrap_or_default()
            }
        };

        let filter = self.filter_for(column_id(target));
        if self.mode == Mode::Filter && self.focus == target {
            format!(" {base} /{filter}_ ")
        } else if filter.is_empty() {
            format!(" {base} ")
        } else {
            format!(" {base} /{filter} ")
        }
    }
}

fn scan_summary(tree: &StackTree, skipped: usize) -> String {
    if skipped == 0 {
        format!(
            "{} stacks across {} levels",
            tree.unit_count(),
            tree.max_depth
        )
    } else {
        format!(
            "{} stacks across {} levels ({skipped} unreadable dirs skipped)",
            tree.unit_count(),
            tree.max_depth
        )
    }
}

fn render_breadcrumb(frame: &mut ratatui::Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    if app.overflow_left() {
        spans.push(Span::styled("◀ ", Style::default().fg(Color::DarkGray)));
    }
    spans.push(Span::styled("Target ", Style::default().fg(Color::Cyan)));
    spans.push(Span::raw(app.breadcrumb()));
    if app.overflow_right() {
        spans.push(Span::styled(" ▶", Style::default().fg(Color::DarkGray)));
    }

    let para = Paragraph::new(Line::from(spans))
        .block(Block::default().title("Path").borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(para, area);
}

fn render_columns(frame: &mut ratatui::Frame, area: Rect, app: &App) {
    let mut constraints = vec![Constraint::Length(ACTION_COLUMN_WIDTH)];
    constraints.extend(
        std::iter::repeat(Constraint::Ratio(1, app.visible_columns as u32))
            .take(app.visible_columns),
    );

    let slots = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(constraints)
        .split(area);

    render_list_column(frame, slots[0], app, Focus::Actions);
    for slot in 0..app.visible_columns {
        let depth = app.window_offset + slot;
        render_list_column(frame, slots[slot + 1], app, Focus::Nav(depth));
    }
}

fn render_list_column(frame: &mut ratatui::Frame, area: Rect, app: &App, target: Focus) {
    let col = column_id(target);
    let items_all = app.column_items(target);
    let filtered = filtered_indices(items_all, app.filter_for(col));
    let items: Vec<ListItem> = filtered
        .iter()
        .map(|&idx| ListItem::new(items_all[idx].clone()))
        .collect();

    let mut state = ListState::default();
    if !filtered.is_empty() {
        let pos = filtered_position(items_all, &filtered, app.selected_in(target)).unwrap_or(0);
        state.select(Some(pos));
        state = state.with_offset(app.scrolls.get(col).copied().unwrap_or(0));
    }

    let focus_style = if app.focus == target && app.mode != Mode::Plan {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .title(app.column_title(target))
                .borders(Borders::ALL)
                .border_style(focus_style),
        )
        .highlight_style(
            Style::default()
                .bg(Color::Rgb(44, 54, 84))
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(" > ");

    frame.render_stateful_widget(list, area, &mut state);
}

fn render_status(frame: &mut ratatui::Frame, area: Rect, app: &App) {
    let key_line = Line::from(vec![
        Span::styled("←→/hl", Style::default().fg(Color::Cyan)),
        Span::raw(" columns  "),
        Span::styled("↑↓/jk", Style::default().fg(Color::Cyan)),
        Span::raw(" select  "),
        Span::styled("/", Style::default().fg(Color::Cyan)),
        Span::raw(" filter  "),
        Span::styled("esc", Style::default().fg(Color::Cyan)),
        Span::raw(" clear  "),
        Span::styled("v", Style::default().fg(Color::Cyan)),
        Span::raw(" plan  "),
        Span::styled("enter", Style::default().fg(Color::Green)),
        Span::raw(" run  "),
        Span::styled("g", Style::default().fg(Color::Yellow)),
        Span::raw(" rescan  "),
        Span::styled("q", Style::default().fg(Color::Red)),
        Span::raw(" quit"),
    ]);

    let meta = format!(
        "levels {}  window {}+{}  skipped {}",
        max_visible_depth(&app.nav),
        app.window_offset,
        app.visible_columns,
        app.skipped
    );
    let meta_line = Line::from(Span::styled(meta, Style::default().fg(Color::DarkGray)));

    let bottom = if app.mode == Mode::Filter {
        Line::from(format!("filter> {}", app.filter_for(column_id(app.focus))))
    } else {
        Line::from(app.status.clone())
    };

    let para = Paragraph::new(vec![key_line, meta_line, bottom])
        .block(Block::default().title("Status").borders(Borders::ALL))
        .wrap(Wrap { trim: false });
    frame.render_widget(para, area);
}

fn render_plan(frame: &mut ratatui::Frame, area: Rect, app: &App) {
    let Some(plan) = app.plan.as_ref() else {
        return;
    };

    let overlay = centered_rect(area, 80, 80);
    frame.render_widget(Clear, overlay);
    let para = Paragraph::new(plan.lines.clone())
        .block(
            Block::default()
                .title(format!(" {} ", plan.title))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .scroll((u16::try_from(plan.scroll).unwrap_or(u16::MAX), 0))
        .wrap(Wrap { trim: false });
    frame.render_widget(para, overlay);
}

fn centered_rect(area: Rect, pct_x: u16, pct_y: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - pct_y) / 2),
            Constraint::Percentage(pct_y),
            Constraint::Percentage((100 - pct_y) / 2),
        ])
        .split(area);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - pct_x) / 2),
            Constraint::Percentage(pct_x),
            Constraint::Percentage((100 - pct_x) / 2),
        ])
        .split(vertical[1]);
    horizontal[1]
}

fn load_plan(path: &Path) -> Result<Vec<Line<'static>>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(plan_lines(&value))
}

/// Terraform-style change-set rendering: one line per resource change,
/// no-ops dropped, with a plan-summary header.
fn plan_lines(value: &Value) -> Vec<Line<'static>> {
    let Some(changes) = value.get("resource_changes").and_then(Value::as_array) else {
        return vec![Line::from("no resource_changes in change-set")];
    };

    let mut add = 0usize;
    let mut change = 0usize;
    let mut destroy = 0usize;
    let mut body = Vec::new();

    for entry in changes {
        let address = entry
            .get("address")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        let actions: Vec<String> = entry
            .get("change")
            .and_then(|c| c.get("actions"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let Some((marker, style)) = action_marker(&actions) else {
            continue;
        };
        match marker {
            "+" => add += 1,
            "~" => change += 1,
            "-" => destroy += 1,
            "-/+" => {
                add += 1;
                destroy += 1;
            }
            _ => {}
        }
        body.push(Line::from(vec![
            Span::styled(format!("{marker:>3} "), style),
            Span::raw(address),
        ]));
    }

    let mut lines = vec![
        Line::from(Span::styled(
            format!("Plan: {add} to add, {change} to change, {destroy} to destroy"),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(String::new()),
    ];
    if body.is_empty() {
        lines.push(Line::from("no pending changes"));
    } else {
        lines.extend(body);
    }
    lines
}

fn action_marker(actions: &[String]) -> Option<(&'static str, Style)> {
    let has = |name: &str| actions.iter().any(|a| a == name);
    if has("create") && has("delete") {
        return Some(("-/+", Style::default().fg(Color::Magenta)));
    }
    if has("create") {
        return Some(("+", Style::default().fg(Color::Green)));
    }
    if has("delete") {
        return Some(("-", Style::default().fg(Color::Red)));
    }
    if has("update") {
        return Some(("~", Style::default().fg(Color::Yellow)));
    }
    if has("read") {
        return Some(("<=", Style::default().fg(Color::Cyan)));
    }
    None
}

struct RunRecord {
    command: String,
    path: String,
    started_at: String,
}

struct History {
    conn: Connection,
}

impl History {
    fn open_default() -> Result<Self> {
        let path = resolve_history_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Self::open(&path)
    }

    fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open history db {}", path.display()))?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory history")?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                path TEXT NOT NULL,
                started_at TEXT NOT NULL
            );",
        )
        .context("failed to initialize history schema")?;
        Ok(())
    }

    fn record(&self, command: &str, path: &Path) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO runs (id, command, path, started_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    command,
                    path.display().to_string(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to insert run record")?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT command, path, started_at FROM runs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(RunRecord {
                command: row.get(0)?,
                path: row.get(1)?,
                started_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn resolve_history_path() -> Result<PathBuf> {
    if let Ok(path) = env::var("STACKNAV_HISTORY") {
        let expanded = expand_tilde(path.trim());
        if !expanded.as_os_str().is_empty() {
            return Ok(expanded);
        }
    }

    let home = env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("stacknav")
        .join("history.db"))
}

fn expand_tilde(input: &str) -> PathBuf {
    if input.is_empty() {
        return PathBuf::new();
    }

    if input == "~" {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home);
        }
    }

    if let Some(rest) = input.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    PathBuf::from(input)
}
