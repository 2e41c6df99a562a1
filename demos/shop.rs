//! Demo test suite for a small web shop model
//!
//! Run it against a live engine with:
//!
//! ```text
//! cargo run --example shop -- online tests -m demos/models/shop.json "random(vertex_coverage(100))"
//! ```
//!
//! or replay a fixed path without the engine:
//!
//! ```text
//! cargo run --example shop -- walk tests demos/models/shop_path.json
//! ```

use std::fmt::Write;
use std::process::ExitCode;

use serde_json::json;
use walker::{cli, StepContext, StepOutcome, Suite, SuiteCatalog};

fn items_in_cart(ctx: &StepContext) -> i64 {
    ctx.data
        .get("itemsInCart")
        .and_then(|value| value.as_i64())
        .unwrap_or(0)
}

fn v_homepage(ctx: &mut StepContext) -> StepOutcome {
    writeln!(ctx, "Cart button and product list are present")?;
    Ok(())
}

fn v_product_page(ctx: &mut StepContext) -> StepOutcome {
    writeln!(ctx, "Viewing product page")?;
    Ok(())
}

fn e_add_to_cart(ctx: &mut StepContext) -> StepOutcome {
    let items = items_in_cart(ctx) + 1;
    ctx.data.insert("itemsInCart".to_string(), json!(items));
    writeln!(ctx, "Added an item, cart now holds {}", items)?;
    Ok(())
}

fn v_cart_open_and_not_empty(ctx: &mut StepContext) -> StepOutcome {
    let items = items_in_cart(ctx);
    writeln!(ctx, "Items in cart: {}", items)?;
    if items == 0 {
        return Err("Should have at least one item in cart".into());
    }
    Ok(())
}

fn catalog() -> SuiteCatalog {
    SuiteCatalog::new().register("tests", || {
        Suite::new()
            .step("v_homepage", v_homepage)
            .step("v_product_page", v_product_page)
            .step("e_add_to_cart", e_add_to_cart)
            .step("v_cart_open_and_not_empty", v_cart_open_and_not_empty)
            .step("e_do_nothing", |_| Ok(()))
            .model("Checkout", |m| {
                m.step("e_open_cart", |ctx| {
                    writeln!(ctx, "Opening cart from checkout")?;
                    Ok(())
                })
            })
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    cli::run(catalog()).await
}
