//! `chx search` and `chx index status` front-ends over [`RetrievalEngine`].

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use comment_harness_core::retrieval::CentroidScope;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::retrieval::{attach_details, RetrievalEngine, SearchResponse};
use crate::store;

#[derive(Debug, Clone)]
pub enum SearchRequest {
    Similar {
        login: String,
        query: String,
    },
    Centroid {
        login: String,
        session: Option<i64>,
        position: Option<f64>,
    },
    Emotion {
        login: String,
        weights: Vec<(String, f64)>,
    },
}

/// Parse one `--weight key=w` argument.
pub fn parse_weight(s: &str) -> Result<(String, f64), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=WEIGHT: no '=' found in '{}'", s))?;
    let key = s[..pos].trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=WEIGHT: empty key in '{}'", s));
    }
    let weight = s[pos + 1..]
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid weight in '{}': {}", s, e))?;
    Ok((key.to_string(), weight))
}

/// Fold repeated `--weight` flags; a repeated key adds up.
fn collect_weights(weights: Vec<(String, f64)>) -> BTreeMap<String, f64> {
    let mut map = BTreeMap::new();
    for (key, w) in weights {
        *map.entry(key).or_insert(0.0) += w;
    }
    map
}

pub async fn run_search(config: &Config, request: SearchRequest, k: Option<usize>) -> Result<()> {
    if let SearchRequest::Similar { query, .. } = &request {
        if query.trim().is_empty() {
            println!("No results.");
            return Ok(());
        }
    }

    let provider = create_provider(&config.embedding)?;
    let engine = RetrievalEngine::new(config, provider);

    let mut response = match request {
        SearchRequest::Similar { login, query } => {
            if !config.embedding.is_enabled() {
                bail!("Similarity search requires embeddings. Set [embedding] provider in config.");
            }
            engine.similar(&login, &query, k).await?
        }
        SearchRequest::Centroid {
            login,
            session,
            position,
        } => {
            let scope = match session {
                Some(id) => CentroidScope::Session(id),
                None => CentroidScope::All,
            };
            engine.centroid(&login, scope, position, k).await?
        }
        SearchRequest::Emotion { login, weights } => {
            if weights.is_empty() {
                bail!("Emotion search needs at least one --weight key=w");
            }
            engine.emotion(&login, collect_weights(weights), k).await?
        }
    };

    let pool = db::connect(config).await?;
    attach_details(&pool, &mut response).await?;
    pool.close().await;

    print_response(&response);
    Ok(())
}

fn print_response(response: &SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    println!(
        "{} search for {} (generation {}, {})",
        response.mode, response.login, response.generation, response.metric
    );
    println!();
    for result in &response.results {
        let who = result
            .detail
            .as_ref()
            .and_then(|d| d.commenter_login.as_deref())
            .unwrap_or("(anonymous)");
        println!(
            "{}. [{:.4}] {} @ {}s",
            result.rank, result.distance, who, result.offset_seconds
        );
        println!("    session: {}", result.session_id);
        if let Some(detail) = &result.detail {
            println!("    reactions: +{} / -{}", detail.likes, detail.dislikes);
        }
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", result.comment_id);
        println!();
    }
}

pub async fn run_index_status(config: &Config, logins: Vec<String>) -> Result<()> {
    let logins = if logins.is_empty() {
        let pool = db::connect(config).await?;
        let owners = store::session_owner_logins(&pool).await?;
        pool.close().await;
        owners
    } else {
        logins
    };

    let provider = create_provider(&config.embedding)?;
    let engine = RetrievalEngine::new(config, provider);

    println!("index status");
    for login in &logins {
        let status = engine.status(login).await?;
        println!("  {}:", status.login);
        match status.generation {
            Some(g) => println!("    generation: {}", g),
            None => println!("    generation: none"),
        }
        println!("    vectors: {}", status.vectors);
        println!("    dims: {}", status.dims);
        if let Some(model) = &status.model {
            println!("    model: {}", model);
        }
        if let Some(ts) = status.built_at {
            let built = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| ts.to_string());
            println!("    built: {}", built);
        }
        if status.building {
            println!("    building: true");
        }
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight() {
        assert_eq!(parse_weight("joy=0.5").unwrap(), ("joy".to_string(), 0.5));
        assert_eq!(parse_weight(" anger = -1 ").unwrap(), ("anger".to_string(), -1.0));
        assert!(parse_weight("joy").is_err());
        assert!(parse_weight("=1").is_err());
        assert!(parse_weight("joy=lots").is_err());
    }

    #[test]
    fn test_repeated_weights_add_up() {
        let map = collect_weights(vec![
            ("joy".to_string(), 0.5),
            ("anger".to_string(), 1.0),
            ("joy".to_string(), 0.25),
        ]);
        assert_eq!(map["joy"], 0.75);
        assert_eq!(map["anger"], 1.0);
    }
}
