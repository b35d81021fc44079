// =============================================================================
// SSE Feed — once-per-second push of prices and counters
// =============================================================================
//
// `GET /api/feed` streams `{prices, conditions_count, positions_count}` every
// second. Values come from the same price book and sniper the matcher uses,
// so the stream and `/api/status` can never disagree beyond one update
// cycle.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use tracing::debug;

use crate::app_state::AppState;

pub async fn feed_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("sse client connected");
    let interval = tokio::time::interval(Duration::from_secs(1));

    let stream = futures_util::stream::unfold(
        (state, interval),
        |(state, mut interval)| async move {
            interval.tick().await;
            let event = Ok(feed_event(&state));
            Some((event, (state, interval)))
        },
    );

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn feed_event(state: &AppState) -> Event {
    let account = state.sniper.status();
    let prices: Vec<serde_json::Value> = state
        .book
        .all()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "coin": t.coin,
                "price": t.price,
                "change_24h": t.change_24h,
            })
        })
        .collect();

    let payload = serde_json::json!({
        "prices": prices,
        "conditions_count": account.active_conditions,
        "positions_count": account.open_positions.len(),
    });

    Event::default().data(payload.to_string())
}
