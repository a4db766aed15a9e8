use crate::AppState;
use axum::extract::{Query, RawQuery, State};
use axum::response::Response;
use log::*;
use serde::{Deserialize, Serialize};
use sse::Connection;
use std::time::Duration;

const CAT_QUOTES: [&str; 6] = [
    "\"Cats are connoisseurs of comfort.\" - James Herriot",
    "\"Just watching my cats can make me happy.\" - Paula Cole",
    "\"I'm not sure why I like cats so much. I mean, they're really cute obviously. They are both wild and domestic at the same time.\" - Michael Showalter",
    "\"You can not look at a sleeping cat and feel tense.\" - Jane Pauley",
    "\"The phrase 'domestic cat' is an oxymoron.\" - George Will",
    "\"One cat just leads to another.\" - Ernest Hemingway",
];

const FRASI_GATTO: [&str; 6] = [
    "\"I gatti sono intenditori del comfort.\" - James Herriot",
    "\"Guardare i miei gatti può farmi felice.\" - Paula Cole",
    "\"Non sono sicuro del perché mi piacciano così tanto i gatti. Voglio dire, sono ovviamente molto carini. Sono sia selvatici che domestici allo stesso tempo.\" - Michael Showalter",
    "\"Non puoi guardare un gatto che dorme e sentirti teso.\" - Jane Pauley",
    "\"La frase 'gatto domestico' è un ossimoro.\" - George Will",
    "\"Un gatto porta ad un altro.\" - Ernest Hemingway",
];

const QUOTE_COUNT: usize = 10;
const QUOTE_INTERVAL: Duration = Duration::from_secs(1);
const CUSTOM_EVENT_INTERVAL: Duration = Duration::from_millis(300);

// Sent in place of the last quote so clients see a payload that is not JSON.
const MALFORMED_QUOTE: &str = "qw___";

#[derive(Debug, Deserialize)]
pub(crate) struct QuoteParams {
    lang: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct Quote {
    pub id: String,
    pub value: String,
}

fn find_cat_quote(lang: &str, index: usize) -> Quote {
    let (lang, quotes) = match lang {
        "it" => ("it", &FRASI_GATTO),
        _ => ("en", &CAT_QUOTES),
    };
    let index = index % quotes.len();
    Quote {
        id: format!("item-{index}-{lang}"),
        value: quotes[index].to_string(),
    }
}

/// GET|POST a stream of cat quotes on the `cat-quote` event.
///
/// Ends the stream itself after the last quote.
pub async fn cat_quotes(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
    Query(params): Query<QuoteParams>,
) -> Response {
    let lang = params.lang.unwrap_or_else(|| "en".to_string());
    app_state
        .streams
        .serve(query.as_deref(), &app_state.stream_options(), move |conn| {
            dump_quotes(lang, conn)
        })
}

async fn dump_quotes(lang: String, conn: Connection) -> Option<sse::Cleanup> {
    for i in 0..QUOTE_COUNT {
        let sent = if i == QUOTE_COUNT - 1 {
            conn.emit("cat-quote", MALFORMED_QUOTE)
        } else {
            conn.emit_json("cat-quote", &find_cat_quote(&lang, i))
        };

        if let Err(e) = sent {
            debug!("Stopping quotes for stream {}: {}", conn.id(), e);
            conn.close();
            return None;
        }
        tokio::time::sleep(QUOTE_INTERVAL).await;
    }

    conn.close();
    let id = conn.id().clone();
    Some(Box::new(move || debug!("Quote stream {id} finished")))
}

/// GET|POST a multi-line `message` event every few hundred milliseconds until
/// the client goes away.
pub async fn custom_event(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Response {
    let options = app_state
        .stream_options()
        .stop(|id| info!("Client of stream {id} disconnected"));
    app_state
        .streams
        .serve(query.as_deref(), &options, |conn| async move {
            loop {
                let now = chrono::Utc::now().timestamp_millis();
                if conn
                    .emit("message", &format!("/custom-event says \n {now}"))
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(CUSTOM_EVENT_INTERVAL).await;
            }
            None
        })
}
