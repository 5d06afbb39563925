//! Shared test harness: an in-memory SQLite database with the full schema,
//! wired-up services, and seed helpers.

#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DbBackend, EntityTrait, Schema,
    Set,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use storeops_api::{
    db::DbPool,
    entities::{
        barcode_unit, batch_reservation, customer, defective_unit, dispatch, dispatch_item, order,
        order_item, product, product_batch, stock_movement, store, UnitStatus,
    },
    events::Event,
    AppServices,
};

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: AppServices,
    // Held so fire-and-forget event sends never hit a closed channel.
    pub events: mpsc::Receiver<Event>,
}

/// Boots a fresh in-memory database. A single pooled connection is required:
/// every `sqlite::memory:` connection is its own database.
pub async fn spawn_app() -> TestApp {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options
        .max_connections(1)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(5))
        .sqlx_logging(false);

    let db = Database::connect(options)
        .await
        .expect("Failed to open in-memory database");
    create_schema(&db).await;

    let db = Arc::new(db);
    let (services, events) = AppServices::new(db.clone(), 64);
    TestApp { db, services, events }
}

async fn create_schema(db: &DbPool) {
    let schema = Schema::new(DbBackend::Sqlite);
    let backend = db.get_database_backend();

    macro_rules! create_table {
        ($entity:expr) => {
            db.execute(backend.build(&schema.create_table_from_entity($entity)))
                .await
                .expect("Failed to create table");
        };
    }

    create_table!(store::Entity);
    create_table!(customer::Entity);
    create_table!(product::Entity);
    create_table!(product_batch::Entity);
    create_table!(barcode_unit::Entity);
    create_table!(order::Entity);
    create_table!(order_item::Entity);
    create_table!(dispatch::Entity);
    create_table!(dispatch_item::Entity);
    create_table!(defective_unit::Entity);
    create_table!(stock_movement::Entity);
    create_table!(batch_reservation::Entity);
}

pub async fn create_store(db: &DbPool, name: &str) -> store::Model {
    store::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        code: Set(format!("{}-{}", name.to_uppercase(), &Uuid::new_v4().to_string()[..8])),
        is_active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("Failed to seed store")
}

pub async fn create_customer(db: &DbPool, name: &str, phone: &str) -> customer::Model {
    let now = Utc::now();
    customer::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        phone: Set(phone.to_string()),
        email: Set(None),
        customer_type: Set("counter".to_string()),
        is_active: Set(true),
        total_purchases: Set(Decimal::ZERO),
        purchase_count: Set(0),
        last_purchase_at: Set(None),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(db)
    .await
    .expect("Failed to seed customer")
}

pub async fn create_product(db: &DbPool, name: &str) -> product::Model {
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        sku: Set(format!("SKU-{}", &Uuid::new_v4().to_string()[..8])),
        is_active: Set(true),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("Failed to seed product")
}

pub async fn create_batch(
    db: &DbPool,
    product: &product::Model,
    store: &store::Model,
    quantity: i32,
    cost_price: Decimal,
    sell_price: Decimal,
) -> product_batch::Model {
    let now = Utc::now();
    product_batch::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product.id),
        store_id: Set(store.id),
        batch_number: Set(format!("B-{}", &Uuid::new_v4().to_string()[..8])),
        quantity: Set(quantity),
        cost_price: Set(cost_price),
        sell_price: Set(sell_price),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(Some(now)),
    }
    .insert(db)
    .await
    .expect("Failed to seed batch")
}

pub async fn create_unit(
    db: &DbPool,
    batch: &product_batch::Model,
    code: &str,
) -> barcode_unit::Model {
    let now = Utc::now();
    barcode_unit::ActiveModel {
        id: Set(Uuid::new_v4()),
        barcode: Set(code.to_string()),
        product_id: Set(batch.product_id),
        batch_id: Set(batch.id),
        current_store_id: Set(batch.store_id),
        status: Set(UnitStatus::InWarehouse),
        is_active: Set(true),
        is_defective: Set(false),
        dispatch_item_id: Set(None),
        location_updated_at: Set(None),
        location_note: Set(None),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .expect("Failed to seed barcode unit")
}

pub async fn reload_batch(db: &DbPool, batch_id: Uuid) -> product_batch::Model {
    product_batch::Entity::find_by_id(batch_id)
        .one(db)
        .await
        .expect("Failed to reload batch")
        .expect("Batch disappeared")
}

pub async fn reload_unit(db: &DbPool, unit_id: Uuid) -> barcode_unit::Model {
    barcode_unit::Entity::find_by_id(unit_id)
        .one(db)
        .await
        .expect("Failed to reload unit")
        .expect("Unit disappeared")
}
