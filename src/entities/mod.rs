pub mod address;
pub mod agency;
pub mod cart;
pub mod cart_line;
pub mod order;
pub mod order_price_history;
pub mod payment;
pub mod payment_method;
pub mod price_history;
pub mod product;
pub mod promotion;

pub use address::Entity as Address;
pub use agency::Entity as Agency;
pub use cart::Entity as Cart;
pub use cart_line::Entity as CartLine;
pub use order::Entity as Order;
pub use order_price_history::Entity as OrderPriceHistory;
pub use payment::Entity as Payment;
pub use payment_method::Entity as PaymentMethod;
pub use price_history::Entity as PriceHistory;
pub use product::Entity as Product;
pub use promotion::Entity as Promotion;

pub use cart::Model as CartModel;
pub use cart_line::Model as CartLineModel;
pub use order::Model as OrderModel;
pub use payment::Model as PaymentModel;
