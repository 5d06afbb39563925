mod common;

use assert_matches::assert_matches;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use storeops_api::{
    entities::{
        customer, stock_movement, FulfillmentStatus, MovementType, OrderStatus, OrderType,
        UnitStatus,
    },
    errors::ServiceError,
    services::orders::{
        CreateOrderItemRequest, CreateOrderRequest, CustomerDetails, ItemFulfillment,
        UpdateItemRequest,
    },
};

use common::*;

fn order_request(
    order_type: OrderType,
    store_id: Option<uuid::Uuid>,
    items: Vec<CreateOrderItemRequest>,
) -> CreateOrderRequest {
    CreateOrderRequest {
        order_type,
        customer_id: None,
        customer: Some(CustomerDetails {
            name: "Amina Rahman".into(),
            phone: format!("01{}", &uuid::Uuid::new_v4().to_string()[..9]),
            email: None,
        }),
        store_id,
        items,
        discount_amount: None,
        shipping_amount: None,
        notes: None,
        created_by: None,
    }
}

fn item_request(
    product_id: uuid::Uuid,
    batch_id: uuid::Uuid,
    quantity: i32,
    unit_price: Decimal,
) -> CreateOrderItemRequest {
    CreateOrderItemRequest {
        product_id,
        batch_id,
        barcode: None,
        quantity,
        unit_price,
        discount_amount: None,
        tax_amount: None,
    }
}

#[tokio::test]
async fn counter_order_completes_and_debits_stock() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            Some(store.id),
            vec![item_request(product.id, batch.id, 3, dec!(8.00))],
        ))
        .await
        .unwrap();

    assert_eq!(created.order.status, OrderStatus::Pending);
    assert_eq!(created.order.subtotal, dec!(24.00));
    assert_eq!(created.order.total_amount, dec!(24.00));
    assert_eq!(created.items.len(), 1);
    assert_eq!(created.items[0].cogs, dec!(15.00));
    // Stock is only debited at completion.
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 10);

    let completed = app.services.orders.complete(created.order.id, None).await.unwrap();
    assert_eq!(completed.order.status, OrderStatus::Confirmed);
    assert!(completed.order.confirmed_at.is_some());
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 7);

    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::BatchId.eq(batch.id))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].movement_type, MovementType::Sale);
    assert_eq!(movements[0].quantity, -3);

    let buyer = customer::Entity::find_by_id(completed.order.customer_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buyer.purchase_count, 1);
    assert_eq!(buyer.total_purchases, dec!(24.00));
    assert!(buyer.last_purchase_at.is_some());
}

#[tokio::test]
async fn counter_order_requires_a_store() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;

    let result = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            None,
            vec![item_request(product.id, batch.id, 1, dec!(8.00))],
        ))
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn creation_fails_fast_on_insufficient_stock() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 5, dec!(5.00), dec!(8.00)).await;

    let result = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            Some(store.id),
            vec![item_request(product.id, batch.id, 6, dec!(8.00))],
        ))
        .await;
    assert_matches!(
        result,
        Err(ServiceError::InsufficientStock {
            requested: 6,
            available: 5,
            ..
        })
    );
}

#[tokio::test]
async fn deferred_order_cannot_complete_before_fulfillment() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Ecommerce,
            Some(store.id),
            vec![item_request(product.id, batch.id, 2, dec!(8.00))],
        ))
        .await
        .unwrap();
    assert_eq!(
        created.order.fulfillment_status,
        Some(FulfillmentStatus::PendingFulfillment)
    );

    let result = app.services.orders.complete(created.order.id, None).await;
    assert_matches!(result, Err(ServiceError::FulfillmentRequired(id)) if id == created.order.id);

    // Nothing moved.
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 10);
}

#[tokio::test]
async fn fulfillment_splits_items_and_completion_sells_the_units() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;
    let unit_a = create_unit(&app.db, &batch, "100000000001").await;
    let unit_b = create_unit(&app.db, &batch, "100000000002").await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Ecommerce,
            Some(store.id),
            vec![item_request(product.id, batch.id, 2, dec!(8.00))],
        ))
        .await
        .unwrap();
    let total_before = created.order.total_amount;

    let fulfilled = app
        .services
        .orders
        .fulfill(
            created.order.id,
            vec![ItemFulfillment {
                order_item_id: created.items[0].id,
                barcodes: vec!["100000000001".into(), "100000000002".into()],
            }],
            None,
        )
        .await
        .unwrap();

    assert_eq!(fulfilled.order.fulfillment_status, Some(FulfillmentStatus::Fulfilled));
    assert_eq!(fulfilled.items.len(), 2);
    for item in &fulfilled.items {
        assert_eq!(item.quantity, 1);
        assert!(item.barcode_unit_id.is_some());
    }
    // Splitting preserves the order totals.
    assert_eq!(fulfilled.order.total_amount, total_before);

    let completed = app.services.orders.complete(created.order.id, None).await.unwrap();
    assert_eq!(completed.order.status, OrderStatus::Confirmed);
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 8);

    for unit in [unit_a, unit_b] {
        let reloaded = reload_unit(&app.db, unit.id).await;
        assert_eq!(reloaded.status, UnitStatus::Sold);
        assert!(!reloaded.is_active);
    }
}

#[tokio::test]
async fn fulfillment_rejects_a_wrong_barcode_count() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;
    create_unit(&app.db, &batch, "100000000001").await;
    create_unit(&app.db, &batch, "100000000002").await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::SocialCommerce,
            Some(store.id),
            vec![item_request(product.id, batch.id, 3, dec!(8.00))],
        ))
        .await
        .unwrap();

    let result = app
        .services
        .orders
        .fulfill(
            created.order.id,
            vec![ItemFulfillment {
                order_item_id: created.items[0].id,
                barcodes: vec!["100000000001".into(), "100000000002".into()],
            }],
            None,
        )
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(_)));

    // The rejected fulfillment left no trace.
    let reloaded = app.services.orders.get_order(created.order.id).await.unwrap();
    assert_eq!(
        reloaded.order.fulfillment_status,
        Some(FulfillmentStatus::PendingFulfillment)
    );
    assert_eq!(reloaded.items.len(), 1);
    assert_eq!(reloaded.items[0].quantity, 3);
}

#[tokio::test]
async fn split_shares_discount_with_the_last_unit_absorbing_the_remainder() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(50.00)).await;
    for code in ["200000000001", "200000000002", "200000000003"] {
        create_unit(&app.db, &batch, code).await;
    }

    let mut request = order_request(
        OrderType::Ecommerce,
        Some(store.id),
        vec![CreateOrderItemRequest {
            product_id: product.id,
            batch_id: batch.id,
            barcode: None,
            quantity: 3,
            unit_price: dec!(50.00),
            discount_amount: Some(dec!(10.00)),
            tax_amount: None,
        }],
    );
    request.discount_amount = None;
    let created = app.services.orders.create_order(request).await.unwrap();

    let fulfilled = app
        .services
        .orders
        .fulfill(
            created.order.id,
            vec![ItemFulfillment {
                order_item_id: created.items[0].id,
                barcodes: vec![
                    "200000000001".into(),
                    "200000000002".into(),
                    "200000000003".into(),
                ],
            }],
            None,
        )
        .await
        .unwrap();

    let mut discounts: Vec<Decimal> =
        fulfilled.items.iter().map(|i| i.discount_amount).collect();
    discounts.sort();
    assert_eq!(discounts, vec![dec!(3.33), dec!(3.33), dec!(3.34)]);
    let total_discount: Decimal = fulfilled.items.iter().map(|i| i.discount_amount).sum();
    assert_eq!(total_discount, dec!(10.00));

    let total_cogs: Decimal = fulfilled.items.iter().map(|i| i.cogs).sum();
    assert_eq!(total_cogs, dec!(15.00));
}

#[tokio::test]
async fn auto_assignment_places_items_at_the_store_with_stock() {
    let app = spawn_app().await;
    let store_a = create_store(&app.db, "North").await;
    let store_b = create_store(&app.db, "South").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    // Only the south store can cover the quantity.
    create_batch(&app.db, &product, &store_a, 1, dec!(5.00), dec!(8.00)).await;
    let batch_b = create_batch(&app.db, &product, &store_b, 20, dec!(4.50), dec!(8.00)).await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Ecommerce,
            None,
            vec![item_request(product.id, batch_b.id, 5, dec!(8.00))],
        ))
        .await
        .unwrap();
    assert_eq!(created.order.store_id, None);

    let assigned = app
        .services
        .orders
        .assign_stores(created.order.id, None, None)
        .await
        .unwrap();
    assert_eq!(assigned.order.status, OrderStatus::MultiStoreAssigned);
    assert_eq!(assigned.items[0].batch_id, batch_b.id);
    // COGS re-frozen from the assigned batch.
    assert_eq!(assigned.items[0].cogs, dec!(22.50));
}

#[tokio::test]
async fn item_updates_revalidate_stock_and_are_blocked_after_fulfillment() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 4, dec!(5.00), dec!(8.00)).await;
    create_unit(&app.db, &batch, "300000000001").await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Ecommerce,
            Some(store.id),
            vec![item_request(product.id, batch.id, 1, dec!(8.00))],
        ))
        .await
        .unwrap();

    // Raising the quantity beyond the batch fails.
    let result = app
        .services
        .orders
        .update_item(
            created.order.id,
            created.items[0].id,
            UpdateItemRequest {
                quantity: Some(5),
                unit_price: None,
                discount_amount: None,
                tax_amount: None,
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock { .. }));

    app.services
        .orders
        .fulfill(
            created.order.id,
            vec![ItemFulfillment {
                order_item_id: created.items[0].id,
                barcodes: vec!["300000000001".into()],
            }],
            None,
        )
        .await
        .unwrap();

    // Fulfilled lines are pinned.
    let result = app
        .services
        .orders
        .remove_item(created.order.id, created.items[0].id)
        .await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn a_barcode_cannot_back_two_open_orders() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;
    create_unit(&app.db, &batch, "400000000001").await;

    let mut first = order_request(
        OrderType::Counter,
        Some(store.id),
        vec![CreateOrderItemRequest {
            product_id: product.id,
            batch_id: batch.id,
            barcode: Some("400000000001".into()),
            quantity: 1,
            unit_price: dec!(8.00),
            discount_amount: None,
            tax_amount: None,
        }],
    );
    first.customer = Some(CustomerDetails {
        name: "First Buyer".into(),
        phone: "0170000001".into(),
        email: None,
    });
    app.services.orders.create_order(first).await.unwrap();

    let second = order_request(
        OrderType::Counter,
        Some(store.id),
        vec![CreateOrderItemRequest {
            product_id: product.id,
            batch_id: batch.id,
            barcode: Some("400000000001".into()),
            quantity: 1,
            unit_price: dec!(8.00),
            discount_amount: None,
            tax_amount: None,
        }],
    );
    let result = app.services.orders.create_order(second).await;
    assert_matches!(result, Err(ServiceError::InvalidBarcode { .. }));
}

#[tokio::test]
async fn cancelling_is_final_and_completion_is_terminal() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            Some(store.id),
            vec![item_request(product.id, batch.id, 2, dec!(8.00))],
        ))
        .await
        .unwrap();

    let cancelled = app
        .services
        .orders
        .cancel(created.order.id, Some("Customer changed their mind".into()), None)
        .await
        .unwrap();
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    assert!(cancelled.order.cancelled_at.is_some());
    // Stock was never debited, so nothing to restock.
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 10);

    let result = app.services.orders.cancel(created.order.id, None, None).await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));
    let result = app.services.orders.complete(created.order.id, None).await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));

    // A completed order cannot be cancelled either.
    let other = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            Some(store.id),
            vec![item_request(product.id, batch.id, 1, dec!(8.00))],
        ))
        .await
        .unwrap();
    app.services.orders.complete(other.order.id, None).await.unwrap();
    let result = app.services.orders.cancel(other.order.id, None, None).await;
    assert_matches!(result, Err(ServiceError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn completion_rejects_a_unit_flagged_defective_in_flight() {
    let app = spawn_app().await;
    let store = create_store(&app.db, "Main").await;
    let product = create_product(&app.db, "Ceramic Mug").await;
    let batch = create_batch(&app.db, &product, &store, 10, dec!(5.00), dec!(8.00)).await;
    let unit = create_unit(&app.db, &batch, "700000000001").await;

    let created = app
        .services
        .orders
        .create_order(order_request(
            OrderType::Counter,
            Some(store.id),
            vec![CreateOrderItemRequest {
                barcode: Some("700000000001".into()),
                ..item_request(product.id, batch.id, 1, dec!(8.00))
            }],
        ))
        .await
        .unwrap();

    // The defective flag lands on the unit row after the order claimed it.
    use sea_orm::{ActiveModelTrait, IntoActiveModel, Set};
    let mut flagged = reload_unit(&app.db, unit.id).await.into_active_model();
    flagged.is_defective = Set(true);
    flagged.update(&*app.db).await.unwrap();

    let result = app.services.orders.complete(created.order.id, None).await;
    assert_matches!(result, Err(ServiceError::InvalidBarcode { .. }));

    // Nothing sold, nothing debited, the order is still open.
    assert_eq!(reload_batch(&app.db, batch.id).await.quantity, 10);
    let untouched = reload_unit(&app.db, unit.id).await;
    assert_eq!(untouched.status, UnitStatus::InWarehouse);
    assert!(untouched.is_active);
    let reloaded = app.services.orders.get_order(created.order.id).await.unwrap();
    assert_eq!(reloaded.order.status, OrderStatus::Pending);
}
