//! The two command-line flows, written against generic readers and writers.

use std::io::{BufRead, Write};
use std::time::Instant;

use crate::config::{ChatConfig, ConfigProvider, GatewayConfig};
use crate::gateway::{CompletionReply, CompletionRequest, GatewayClient};
use crate::reconciler::{reconcile_response, reconcile_stream, CompletionResult};
use crate::tokenizer::TokenCounter;
use crate::trace::{TraceInspector, TraceRecord};
use crate::{render, Error};

/// Prints `question` and reads one line of UTF-8 input.
pub fn prompt_line<R: BufRead, W: Write>(
    question: &str,
    input: &mut R,
    out: &mut W,
) -> Result<String, Error> {
    write!(out, "{question}")?;
    out.flush()?;

    let mut line = Vec::new();
    input.read_until(b'\n', &mut line)?;
    let line = String::from_utf8(line)
        .map_err(|e| Error::InvalidInput(format!("input is not valid UTF-8: {e}")))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

/// Asks for a question, streams the answer to `out` and prints the token
/// report.
///
/// Configuration is read before anything touches the network.
pub async fn run_chat<P, R, W>(
    provider: &P,
    input: &mut R,
    out: &mut W,
) -> Result<CompletionResult, Error>
where
    P: ConfigProvider,
    R: BufRead,
    W: Write,
{
    let config = ChatConfig::load(provider)?;
    let client = GatewayClient::new(&config)?;
    let counter = TokenCounter::for_model(&config.token_model)?;

    let prompt = prompt_line("Enter your question: ", input, out)?;
    let request = CompletionRequest::new(prompt, config.stream);
    tracing::info!(
        "prompt token count: {}",
        counter.count_messages(&request.messages)
    );

    let started = Instant::now();
    let mut result = match client.send_completion(&request).await? {
        CompletionReply::Stream(stream) => {
            tracing::info!("streaming response...");
            let trace_id = stream.trace_id().map(str::to_owned);
            let mut result =
                reconcile_stream(stream, &mut *out, &counter, &request.messages).await?;
            result.trace_id = trace_id;
            result
        }
        CompletionReply::Complete(response) => reconcile_response(
            response,
            &mut *out,
            &counter,
            &request.messages,
            started.elapsed(),
        )?,
    };
    result.elapsed = started.elapsed();
    writeln!(out, "\n")?;

    tracing::info!(
        "completion token count (tiktoken): {}",
        result.local_usage.completion_tokens
    );
    tracing::info!("total streaming time: {:.2} seconds", result.elapsed.as_secs_f64());
    result.log_comparison();

    write_report(&result, out)?;
    Ok(result)
}

fn write_report<W: Write>(result: &CompletionResult, out: &mut W) -> Result<(), Error> {
    writeln!(out, "Raw Streamed JSON Output:")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&result.raw_chunks)?)?;

    match &result.provider_usage {
        Some(usage) => {
            writeln!(out, "\nStreamed Usage Data:")?;
            writeln!(out, "{}", serde_json::to_string_pretty(usage)?)?;
        }
        None => writeln!(out, "\nNo usage data was received in the stream.")?,
    }

    writeln!(out, "\n{}", render::comparison_table(result))?;
    writeln!(out, "{}", render::streaming_timeline(result))?;
    writeln!(
        out,
        "Total streaming time: {:.2} seconds",
        result.elapsed.as_secs_f64()
    )?;
    if let Some(trace_id) = &result.trace_id {
        writeln!(out, "Gateway trace id: {trace_id}")?;
    }
    Ok(())
}

/// Fetches a trace and renders it. `trace_id` is prompted for when absent.
///
/// Nothing is rendered when the lookup fails.
pub async fn run_trace<P, R, W>(
    provider: &P,
    trace_id: Option<String>,
    input: &mut R,
    out: &mut W,
) -> Result<TraceRecord, Error>
where
    P: ConfigProvider,
    R: BufRead,
    W: Write,
{
    let config = GatewayConfig::load(provider)?;
    let inspector = TraceInspector::new(&config);

    let trace_id = match trace_id {
        Some(trace_id) => trace_id,
        None => prompt_line("Enter a trace id: ", input, out)?,
    };

    let record = inspector.fetch_trace(&trace_id).await?;
    writeln!(out, "{}", record.render_summary())?;
    writeln!(out, "{}", record.render_table())?;
    writeln!(out, "{}", record.render_chart())?;
    Ok(record)
}
