//! Plain-text tables and charts.
//!
//! Widgets are drawn into an off-screen ratatui [`Buffer`] and the buffer is
//! flattened to lines, so the output can go to any writer.

use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::Span;
use ratatui::widgets::{Axis, Block, Borders, Cell, Chart, Dataset, GraphType, Row, Table, Widget};

use crate::reconciler::CompletionResult;

const COLUMN_SPACING: u16 = 3;

pub const CHART_WIDTH: u16 = 72;
pub const CHART_HEIGHT: u16 = 20;

fn buffer_to_string(buffer: &Buffer) -> String {
    let width = usize::from(buffer.area.width.max(1));
    let mut out = String::new();
    for row in buffer.content.chunks(width) {
        let line: String = row.iter().map(|cell| cell.symbol()).collect();
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn text_width(text: &str) -> u16 {
    u16::try_from(text.chars().count()).unwrap_or(u16::MAX)
}

/// Bordered table sized to fit its contents.
pub fn table(title: &str, header: &[&str], rows: &[Vec<String>]) -> String {
    let widths: Vec<u16> = (0..header.len())
        .map(|column| {
            rows.iter()
                .filter_map(|row| row.get(column))
                .map(|cell| text_width(cell))
                .chain(std::iter::once(text_width(header[column])))
                .max()
                .unwrap_or(1)
                .max(1)
        })
        .collect();

    let columns = u16::try_from(widths.len()).unwrap_or(u16::MAX);
    let inner_width = widths.iter().sum::<u16>() + COLUMN_SPACING * columns.saturating_sub(1);
    let width = inner_width.max(text_width(title)) + 2;
    let height = u16::try_from(rows.len()).unwrap_or(u16::MAX) + 4;
    let area = Rect::new(0, 0, width, height);

    let table = Table::new(
        rows.iter()
            .map(|row| Row::new(row.iter().map(|cell| Cell::from(cell.as_str())))),
        widths.iter().map(|w| Constraint::Length(*w)),
    )
    .header(
        Row::new(header.iter().map(|h| Cell::from(*h)))
            .style(Style::default().add_modifier(Modifier::BOLD))
            .bottom_margin(1),
    )
    .column_spacing(COLUMN_SPACING)
    .block(Block::default().borders(Borders::ALL).title(title));

    let mut buffer = Buffer::empty(area);
    table.render(area, &mut buffer);
    buffer_to_string(&buffer)
}

/// Line chart of `points` (x, y), axes starting at zero.
pub fn line_chart(title: &str, x_title: &str, y_title: &str, points: &[(f64, f64)]) -> String {
    let x_max = points.iter().map(|(x, _)| *x).fold(0.0_f64, f64::max).max(1e-3);
    let y_max = points.iter().map(|(_, y)| *y).fold(0.0_f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .marker(Marker::Braille)
        .graph_type(GraphType::Line)
        .data(points)];
    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title(x_title)
                .bounds([0.0, x_max])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.2}", x_max / 2.0)),
                    Span::raw(format!("{x_max:.2}")),
                ]),
        )
        .y_axis(
            Axis::default()
                .title(y_title)
                .bounds([0.0, y_max])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", y_max / 2.0)),
                    Span::raw(format!("{y_max:.0}")),
                ]),
        );

    let area = Rect::new(0, 0, CHART_WIDTH, CHART_HEIGHT);
    let mut buffer = Buffer::empty(area);
    chart.render(area, &mut buffer);
    buffer_to_string(&buffer)
}

fn or_na(value: Option<u64>) -> String {
    value.map_or_else(|| "N/A".to_owned(), |v| v.to_string())
}

/// Computed counts next to the provider's usage block.
pub fn comparison_table(result: &CompletionResult) -> String {
    let rows: Vec<Vec<String>> = result
        .comparisons()
        .iter()
        .map(|c| vec![c.metric.to_owned(), c.computed.to_string(), or_na(c.reported)])
        .collect();
    table(
        "Comparison",
        &["Metric", "Computed", "API Usage"],
        &rows,
    )
}

/// Cumulative fragments against arrival time.
pub fn streaming_timeline(result: &CompletionResult) -> String {
    let points: Vec<(f64, f64)> = result
        .fragment_offsets
        .iter()
        .enumerate()
        .map(|(i, offset)| (offset.as_secs_f64(), (i + 1) as f64))
        .collect();
    line_chart(
        "Token Streaming Timeline",
        "Time Elapsed (s)",
        "Cumulative Tokens Received",
        &points,
    )
}
