// =============================================================================
// Prompt rendering (part of C5)
// =============================================================================
//
// Substitutes a closed, named set of context keys into the account's bound
// template. A key with no supplied value renders literally as "N/A" —
// never an error — so a template authored for a richer context still
// renders sensibly against a minimal one.
// =============================================================================

use serde_json::{json, Value};

use super::context::PortfolioContext;

pub const NO_NEWS_AVAILABLE: &str = "no recent news available";

/// The fixed JSON schema embedded in every rendered prompt, describing the
/// only reply shape the system accepts.
pub const OUTPUT_FORMAT: &str = r#"{
  "operation": "buy|sell|hold|close",
  "symbol": "<BTC|ETH|SOL|BNB|XRP|DOGE>",
  "target_portion_of_balance": <float in 0.0..1.0>,
  "reason": "<text <=150 chars>",
  "trading_strategy": "<text>"
}"#;

/// One rendering pass's worth of substitutable values. Each field maps
/// directly to one `{key}` placeholder in a template; `Option::None`
/// renders as `"N/A"`.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub session_context: Option<String>,
    pub market_snapshot: Option<String>,
    pub account_state: Option<String>,
    pub decision_task: Option<String>,
    pub output_format: Option<String>,
    pub prices_json: Option<String>,
    pub portfolio_json: Option<String>,
    pub portfolio_positions_json: Option<String>,
    pub news_section: Option<String>,
    pub account_name: Option<String>,
    pub model_name: Option<String>,
}

impl PromptContext {
    fn as_pairs(&self) -> [(&'static str, Option<&str>); 11] {
        [
            ("session_context", self.session_context.as_deref()),
            ("market_snapshot", self.market_snapshot.as_deref()),
            ("account_state", self.account_state.as_deref()),
            ("decision_task", self.decision_task.as_deref()),
            ("output_format", self.output_format.as_deref()),
            ("prices_json", self.prices_json.as_deref()),
            ("portfolio_json", self.portfolio_json.as_deref()),
            ("portfolio_positions_json", self.portfolio_positions_json.as_deref()),
            ("news_section", self.news_section.as_deref()),
            ("account_name", self.account_name.as_deref()),
            ("model_name", self.model_name.as_deref()),
        ]
    }
}

/// Render `template`, substituting every `{key}` occurrence from the closed
/// key set with the corresponding `ctx` value, or `"N/A"` if absent.
pub fn render(template: &str, ctx: &PromptContext) -> String {
    let mut out = template.to_string();
    for (key, value) in ctx.as_pairs() {
        let token = format!("{{{key}}}");
        out = out.replace(&token, value.unwrap_or("N/A"));
    }
    out
}

/// Build the `prices_json` value: a map of symbol -> current price for the
/// account's configured symbols, drawn from the portfolio context and any
/// additional quoted symbols the caller supplies.
pub fn prices_json(portfolio: &PortfolioContext, extra: &[(String, f64)]) -> String {
    let mut map = serde_json::Map::new();
    for p in &portfolio.positions {
        map.insert(p.symbol.clone(), json!(p.current_price));
    }
    for (symbol, price) in extra {
        map.entry(symbol.clone()).or_insert(json!(price));
    }
    Value::Object(map).to_string()
}

/// Build the `portfolio_json` value: cash, total assets, and position
/// count, a compact account-state summary.
pub fn portfolio_json(portfolio: &PortfolioContext) -> String {
    json!({
        "cash": portfolio.cash,
        "total_assets": portfolio.total_assets,
        "position_count": portfolio.positions.len(),
    })
    .to_string()
}

/// Build the `portfolio_positions_json` value: one entry per held position
/// with quantity, current price, and current value. `avg_cost` is not
/// included — the broker does not expose it, and rendering a fabricated
/// value would invite the oracle to reason about PnL that isn't real.
pub fn portfolio_positions_json(portfolio: &PortfolioContext) -> String {
    let entries: Vec<Value> = portfolio
        .positions
        .iter()
        .map(|p| {
            json!({
                "symbol": p.symbol,
                "qty": p.qty,
                "free_qty": p.free_qty,
                "current_price": p.current_price,
                "current_value": p.current_value,
            })
        })
        .collect();
    Value::Array(entries).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_render_as_na() {
        let ctx = PromptContext {
            account_name: Some("demo".to_string()),
            ..Default::default()
        };
        let rendered = render("Hello {account_name}, news: {news_section}", &ctx);
        assert_eq!(rendered, "Hello demo, news: N/A");
    }

    #[test]
    fn all_keys_substitute_when_present() {
        let ctx = PromptContext {
            model_name: Some("gpt-4o".to_string()),
            output_format: Some(OUTPUT_FORMAT.to_string()),
            ..Default::default()
        };
        let rendered = render("{model_name}\n{output_format}", &ctx);
        assert!(rendered.starts_with("gpt-4o"));
        assert!(rendered.contains("target_portion_of_balance"));
    }

    #[test]
    fn prices_json_includes_every_position() {
        let portfolio = PortfolioContext {
            cash: 100.0,
            positions: vec![super::super::context::PositionContext {
                symbol: "BTC".to_string(),
                qty: 1.0,
                free_qty: 1.0,
                current_price: 50000.0,
                current_value: 50000.0,
            }],
            total_assets: 50100.0,
        };
        let s = prices_json(&portfolio, &[]);
        assert!(s.contains("BTC"));
        assert!(s.contains("50000"));
    }
}
